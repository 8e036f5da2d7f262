//! The mesh session actor.
//!
//! One [`MeshSession`] owns every piece of mutable state: the connection
//! registry, the roster, both chat logs, the viewing session and all
//! running transfers. Link events, reconnect timers, transfer reports,
//! keep-alive ticks and console commands are all funnelled into a single
//! loop ([`MeshSession::run`]) and handled one at a time, so nothing here
//! needs a lock.
//!
//! The console talks to the actor through a [`SessionHandle`] and listens
//! for [`SessionNotice`]s.
//!
//! # Architecture
//!
//! ```text
//! console ── SessionCommand ──► MeshSession ◄── LinkNotice ── Connector
//!         ◄── SessionNotice ───      │      ◄── TransferReport ── transfer tasks
//!                                    └──────◄── reconnect timers
//! ```

mod dispatch;
mod transfers;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use meshchat_proto::message::{
    ChatMessage, ChatMode, CoViewingFrame, Envelope, FileMsgId, FileOffer, LogEntry, PeerId,
    PeerStatusLabel, UserList, UsernameUpdate, ValidationError, ViewingSession,
};

use crate::chat::{self, ChatState};
use crate::config::{ChatConfig, ClientConfig, MeshConfig, Role, TransferConfig};
use crate::mesh::lifecycle::PostConnectHook;
use crate::mesh::registry::ConnectionRegistry;
use crate::mesh::roster::{self, HOST_NAME, Roster};
use crate::transfer::{SenderOutcome, SinkTarget, Source, TransferReport, TransferStatus};
use crate::transport::{Connector, LinkEventSink, LinkHandle, LinkId, LinkNotice, TransportError};

use transfers::{DownloadEntry, UploadEntry};

/// Errors returned by [`SessionHandle`] methods.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("session has shut down")]
    Closed,

    /// A file could not be offered.
    #[error("cannot offer {path}: {source}")]
    Offer {
        /// The file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The connector could not start.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a console command was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The chat text failed validation.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The proposed name is empty after trimming.
    #[error("username cannot be empty")]
    InvalidName,

    /// No offer with this id is known.
    #[error("unknown file {0}")]
    UnknownFile(FileMsgId),

    /// Downloading one's own offer.
    #[error("{0} is your own file")]
    OwnFile(FileMsgId),

    /// A transfer link could not be opened.
    #[error("cannot reach {peer}: {reason}")]
    Unreachable {
        /// Offering peer.
        peer: PeerId,
        /// Connector error.
        reason: String,
    },

    /// Only the host may do this.
    #[error("only the host can {0}")]
    HostOnly(&'static str),
}

/// Requests from the console to the session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Broadcast a chat message in the current mode.
    SendChat(String),
    /// Change the local display name.
    SetUsername(String),
    /// Offer a file to the mesh.
    OfferFile {
        /// Displayed file name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// Where the bytes come from.
        source: Source,
    },
    /// Start (or restart) downloading an offered file.
    Download {
        /// The offer.
        file_msg_id: FileMsgId,
        /// Destination; the download directory when `None`.
        target: Option<SinkTarget>,
    },
    /// Cancel a running download.
    CancelDownload(FileMsgId),
    /// Switch which log outgoing chat goes to.
    SetMode(ChatMode),
    /// Start a viewing session (host only).
    StartViewing(String),
    /// End the viewing session (host only).
    StopViewing,
    /// Pass a frame to every connected peer's viewing collaborator.
    SendCoViewing(CoViewingFrame),
    /// Report the current state.
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Say goodbye and stop.
    Shutdown,
}

/// What the session tells the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Someone's status or name changed.
    PeersChanged(Vec<PeerView>),
    /// The local display name changed.
    UsernameChanged(String),
    /// A chat message was admitted (including our own).
    ChatReceived(ChatMessage),
    /// A file offer was admitted (including our own).
    FileOffered(FileOffer),
    /// A history replay was merged.
    HistoryMerged {
        /// Entries added to the normal log.
        normal_added: usize,
        /// Messages added to the co-viewing log.
        co_viewing_added: usize,
    },
    /// Download progress.
    TransferProgress {
        /// File.
        file_msg_id: FileMsgId,
        /// Bytes written.
        received: u64,
        /// Offered size.
        total: u64,
    },
    /// A download ended.
    TransferFinished {
        /// File.
        file_msg_id: FileMsgId,
        /// Final status.
        status: TransferStatus,
    },
    /// An upload ended.
    UploadFinished {
        /// File.
        file_msg_id: FileMsgId,
        /// Downloading peer.
        peer: PeerId,
        /// How it ended.
        outcome: SenderOutcome,
    },
    /// The viewing session started, changed or ended.
    ViewingChanged(Option<ViewingSession>),
    /// A frame for the viewing collaborator arrived.
    CoViewing {
        /// Sending peer.
        from: PeerId,
        /// The frame, untouched.
        frame: CoViewingFrame,
    },
    /// The host went away; this guest will not reconnect.
    SessionEnded,
    /// A command was refused.
    CommandFailed(CommandError),
}

/// One roster line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    /// Peer id.
    pub peer_id: PeerId,
    /// Display name.
    pub name: String,
    /// Status label.
    pub status: PeerStatusLabel,
    /// Colour hashed from the name.
    pub color: &'static str,
    /// Current reconnect delay, for peers with a link record.
    pub backoff: Option<Duration>,
    /// Whether a reconnect timer is outstanding.
    pub reconnect_pending: bool,
}

/// State of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadView {
    /// Offered name.
    pub file_name: String,
    /// Current status.
    pub status: TransferStatus,
    /// Bytes written.
    pub received: u64,
    /// Offered size.
    pub total: u64,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Our peer id.
    pub local_id: PeerId,
    /// Our display name.
    pub username: String,
    /// Host or guest.
    pub role: Role,
    /// Where outgoing chat goes.
    pub mode: ChatMode,
    /// Whether the upstream host is gone.
    pub session_ended: bool,
    /// Everyone we know about, in peer-id order.
    pub peers: Vec<PeerView>,
    /// The normal log.
    pub normal: Vec<LogEntry>,
    /// The co-viewing log.
    pub co_viewing: Vec<ChatMessage>,
    /// The active viewing session.
    pub viewing: Option<ViewingSession>,
    /// Every download started in this session.
    pub downloads: BTreeMap<FileMsgId, DownloadView>,
}

impl SessionSnapshot {
    /// The view of one peer.
    #[must_use]
    pub fn peer(&self, id: &PeerId) -> Option<&PeerView> {
        self.peers.iter().find(|p| &p.peer_id == id)
    }

    /// Chat messages in the normal log.
    pub fn normal_chats(&self) -> impl Iterator<Item = &ChatMessage> {
        self.normal.iter().filter_map(|e| match e {
            LogEntry::Chat(msg) => Some(msg),
            LogEntry::File(_) => None,
        })
    }

    /// File offers in the normal log.
    pub fn files(&self) -> impl Iterator<Item = &FileOffer> {
        self.normal.iter().filter_map(|e| match e {
            LogEntry::File(offer) => Some(offer),
            LogEntry::Chat(_) => None,
        })
    }

    /// Receiver-side state of a listed file: `Ready` until a download is
    /// started, then the download's status. `None` for unknown files and
    /// for our own offers.
    #[must_use]
    pub fn file_status(&self, id: &FileMsgId) -> Option<TransferStatus> {
        if let Some(download) = self.downloads.get(id) {
            return Some(download.status.clone());
        }
        self.files()
            .find(|offer| &offer.file_msg_id == id)
            .filter(|offer| offer.sender_id != self.local_id)
            .map(|_| TransferStatus::Ready)
    }
}

/// Everything that can wake the session.
#[derive(Debug)]
pub enum MeshEvent {
    /// Something happened on a link.
    Link(LinkNotice),
    /// A reconnect timer fired.
    ReconnectDue(PeerId),
    /// A transfer task reported.
    Transfer(TransferReport),
    /// A console command.
    Command(SessionCommand),
    /// Time to sweep links.
    KeepAliveTick,
}

/// Receiving ends of the session's internal channels.
#[derive(Debug)]
pub struct SessionInbox {
    pub(crate) links: mpsc::UnboundedReceiver<LinkNotice>,
    pub(crate) timers: mpsc::UnboundedReceiver<PeerId>,
    pub(crate) reports: mpsc::UnboundedReceiver<TransferReport>,
}

/// The session actor. See the module docs.
pub struct MeshSession {
    pub(crate) local_id: PeerId,
    pub(crate) role: Role,
    pub(crate) username: String,
    pub(crate) chosen_name: bool,
    pub(crate) mode: ChatMode,
    pub(crate) mesh: MeshConfig,
    pub(crate) transfer: TransferConfig,
    pub(crate) limits: ChatConfig,
    pub(crate) download_dir: PathBuf,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) roster: Roster,
    pub(crate) chat: ChatState,
    pub(crate) viewing: Option<ViewingSession>,
    pub(crate) session_ended: bool,
    pub(crate) hooks: Vec<PostConnectHook>,
    pub(crate) offered: HashMap<FileMsgId, Source>,
    pub(crate) uploads: HashMap<(LinkId, FileMsgId), UploadEntry>,
    pub(crate) downloads: HashMap<FileMsgId, DownloadEntry>,
    pub(crate) transfer_links: HashMap<LinkId, LinkHandle>,
    pub(crate) link_tx: LinkEventSink,
    pub(crate) timer_tx: mpsc::UnboundedSender<PeerId>,
    pub(crate) report_tx: mpsc::UnboundedSender<TransferReport>,
    pub(crate) notices: mpsc::UnboundedSender<SessionNotice>,
}

impl std::fmt::Debug for MeshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshSession")
            .field("local_id", &self.local_id)
            .field("role", &self.role)
            .field("username", &self.username)
            .field("session_ended", &self.session_ended)
            .finish_non_exhaustive()
    }
}

impl MeshSession {
    /// Builds a session around `connector`.
    ///
    /// Nothing happens on the network until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, SessionInbox, mpsc::UnboundedReceiver<SessionNotice>) {
        let (link_tx, links) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let local_id = connector.local_id().clone();
        let configured = config
            .username
            .as_deref()
            .and_then(|n| roster::sanitize_name(n, config.chat.max_username_len));
        let chosen_name = configured.is_some();
        let username = configured.unwrap_or_else(|| {
            if config.role.is_host() {
                HOST_NAME.to_string()
            } else {
                local_id.to_string()
            }
        });

        let mut roster = Roster::new();
        if config.role.is_host() || chosen_name {
            roster.set_name(&local_id, username.clone());
        }

        let session = Self {
            local_id,
            role: config.role.clone(),
            username,
            chosen_name,
            mode: ChatMode::Normal,
            mesh: config.mesh.clone(),
            transfer: config.transfer.clone(),
            limits: config.chat.clone(),
            download_dir: config.download_dir.clone(),
            connector,
            registry: ConnectionRegistry::new(config.mesh.initial_backoff, config.mesh.max_backoff),
            roster,
            chat: ChatState::new(),
            viewing: None,
            session_ended: false,
            hooks: PostConnectHook::for_role(&config.role),
            offered: HashMap::new(),
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            transfer_links: HashMap::new(),
            link_tx,
            timer_tx,
            report_tx,
            notices,
        };
        let inbox = SessionInbox {
            links,
            timers,
            reports,
        };
        (session, inbox, notice_rx)
    }

    /// Starts listening and, for a guest, dials the host.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if it cannot listen.
    pub fn start(&mut self) -> Result<(), TransportError> {
        self.connector.listen(self.link_tx.clone())?;
        tracing::info!(peer = %self.local_id, role = ?self.role, "session started");
        if let Some(host) = self.role.host().cloned() {
            self.connect_to(&host);
        }
        self.notify_peers();
        Ok(())
    }

    /// Runs until shut down or until every command sender is dropped.
    pub async fn run(
        mut self,
        mut inbox: SessionInbox,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let mut keepalive = tokio::time::interval(self.mesh.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            let event = tokio::select! {
                Some(notice) = inbox.links.recv() => MeshEvent::Link(notice),
                Some(peer) = inbox.timers.recv() => MeshEvent::ReconnectDue(peer),
                Some(report) = inbox.reports.recv() => MeshEvent::Transfer(report),
                command = commands.recv() => {
                    MeshEvent::Command(command.unwrap_or(SessionCommand::Shutdown))
                }
                _ = keepalive.tick() => MeshEvent::KeepAliveTick,
            };
            if self.handle(event).is_break() {
                break;
            }
        }
        tracing::info!(peer = %self.local_id, "session stopped");
    }

    /// Handles one event. Returns `Break` once the session has shut down.
    pub fn handle(&mut self, event: MeshEvent) -> ControlFlow<()> {
        match event {
            MeshEvent::Link(notice) => self.on_link(notice),
            MeshEvent::ReconnectDue(peer) => self.on_reconnect_due(&peer),
            MeshEvent::Transfer(report) => self.on_transfer_report(report),
            MeshEvent::KeepAliveTick => self.keepalive_tick(),
            MeshEvent::Command(command) => return self.on_command(command),
        }
        ControlFlow::Continue(())
    }

    fn on_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        let result = match command {
            SessionCommand::SendChat(text) => self.send_chat(&text),
            SessionCommand::SetUsername(name) => self.set_username(&name),
            SessionCommand::OfferFile { name, size, source } => {
                self.offer_file(name, size, source);
                Ok(())
            }
            SessionCommand::Download {
                file_msg_id,
                target,
            } => self.start_download(&file_msg_id, target),
            SessionCommand::CancelDownload(file_msg_id) => {
                self.cancel_download(&file_msg_id);
                Ok(())
            }
            SessionCommand::SetMode(mode) => {
                self.mode = mode;
                Ok(())
            }
            SessionCommand::StartViewing(source) => self.start_viewing(source),
            SessionCommand::StopViewing => self.stop_viewing(),
            SessionCommand::SendCoViewing(frame) => {
                self.registry.broadcast(&Envelope::CoViewing(frame), &[]);
                Ok(())
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                Ok(())
            }
            SessionCommand::Shutdown => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "command refused");
            self.notify(SessionNotice::CommandFailed(e));
        }
        ControlFlow::Continue(())
    }

    fn send_chat(&mut self, text: &str) -> Result<(), CommandError> {
        let msg = chat::compose(
            &self.local_id,
            &self.username,
            text,
            self.mode,
            self.limits.max_message_size,
        )?;
        self.chat.admit_chat(&msg);
        let delivered = self.registry.broadcast(&Envelope::Chat(msg.clone()), &[]);
        tracing::debug!(msg_id = %msg.msg_id, delivered, "chat sent");
        self.notify(SessionNotice::ChatReceived(msg));
        Ok(())
    }

    fn set_username(&mut self, raw: &str) -> Result<(), CommandError> {
        let name = roster::sanitize_name(raw, self.limits.max_username_len)
            .ok_or(CommandError::InvalidName)?;
        self.username.clone_from(&name);
        self.chosen_name = true;
        self.roster.set_name(&self.local_id, name.clone());
        self.registry.broadcast(
            &Envelope::Username(UsernameUpdate {
                username: name.clone(),
                peer_id: Some(self.local_id.clone()),
                req_user_list: false,
            }),
            &[],
        );
        if self.role.is_host() {
            self.broadcast_user_list();
        }
        self.notify(SessionNotice::UsernameChanged(name));
        self.notify_peers();
        Ok(())
    }

    fn start_viewing(&mut self, source: String) -> Result<(), CommandError> {
        if !self.role.is_host() {
            return Err(CommandError::HostOnly("start a viewing session"));
        }
        let viewing = ViewingSession {
            active: true,
            host_id: self.local_id.clone(),
            source,
            session_id: uuid::Uuid::now_v7().to_string(),
        };
        tracing::info!(session = %viewing.session_id, "viewing session started");
        self.adopt_viewing(Some(viewing.clone()));
        self.registry.broadcast(&Envelope::SessionInfo(viewing), &[]);
        Ok(())
    }

    fn stop_viewing(&mut self) -> Result<(), CommandError> {
        if !self.role.is_host() {
            return Err(CommandError::HostOnly("end a viewing session"));
        }
        if let Some(mut viewing) = self.viewing.clone() {
            viewing.active = false;
            tracing::info!(session = %viewing.session_id, "viewing session ended");
            self.adopt_viewing(None);
            self.registry.broadcast(&Envelope::SessionInfo(viewing), &[]);
        }
        Ok(())
    }

    /// Installs (or clears) the viewing session. Ending one resets the
    /// co-viewing log and returns chat to normal mode.
    pub(crate) fn adopt_viewing(&mut self, viewing: Option<ViewingSession>) {
        if viewing.is_none() && self.viewing.is_some() {
            self.chat.reset_co_viewing();
            self.mode = ChatMode::Normal;
        }
        self.viewing.clone_from(&viewing);
        self.notify(SessionNotice::ViewingChanged(viewing));
    }

    fn shutdown(&mut self) {
        self.registry.broadcast(
            &Envelope::Goodbye {
                peer_id: self.local_id.clone(),
            },
            &[],
        );
        for upload in self.uploads.values() {
            upload.cancel.cancel();
        }
        for download in self.downloads.values() {
            download.cancel.cancel();
        }
        for link in self.transfer_links.values() {
            link.close();
        }
        self.registry.shutdown();
        tracing::info!(peer = %self.local_id, "said goodbye");
    }

    /// Whether `peer` is this guest's host.
    pub(crate) fn is_upstream(&self, peer: &PeerId) -> bool {
        self.role.host() == Some(peer)
    }

    /// Status shown for `peer`.
    pub(crate) fn peer_status(&self, peer: &PeerId) -> PeerStatusLabel {
        if *peer == self.local_id {
            return PeerStatusLabel::Connected;
        }
        if self.session_ended && self.is_upstream(peer) {
            return PeerStatusLabel::SessionEnded;
        }
        if !self.role.is_host()
            && let Some(status) = self.roster.status_override(peer)
        {
            return status;
        }
        self.registry
            .get(peer)
            .map_or(PeerStatusLabel::Disconnected, |r| r.status().into())
    }

    /// Status of every named peer, as the host reports it.
    pub(crate) fn status_snapshot(&self) -> BTreeMap<PeerId, PeerStatusLabel> {
        self.roster
            .names()
            .keys()
            .map(|id| (id.clone(), self.peer_status(id)))
            .collect()
    }

    /// Sends the roster to every connected guest (host only).
    pub(crate) fn broadcast_user_list(&self) {
        if !self.role.is_host() {
            return;
        }
        let list = UserList {
            users: self.roster.names().clone(),
            statuses: self.status_snapshot(),
        };
        self.registry.broadcast(&Envelope::UserList(list), &[]);
    }

    fn peer_views(&self) -> Vec<PeerView> {
        let mut ids: BTreeSet<PeerId> = self.roster.names().keys().cloned().collect();
        ids.extend(self.registry.iter().map(|r| r.peer_id().clone()));
        ids.insert(self.local_id.clone());
        ids.into_iter()
            .map(|id| {
                let name = if id == self.local_id {
                    self.username.clone()
                } else {
                    self.roster.display_name(&id)
                };
                let record = self.registry.get(&id);
                PeerView {
                    status: self.peer_status(&id),
                    color: roster::display_color(&name),
                    backoff: record.map(|r| r.backoff()),
                    reconnect_pending: record.is_some_and(|r| r.has_pending_reconnect()),
                    name,
                    peer_id: id,
                }
            })
            .collect()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.local_id.clone(),
            username: self.username.clone(),
            role: self.role.clone(),
            mode: self.mode,
            session_ended: self.session_ended,
            peers: self.peer_views(),
            normal: self.chat.logs().normal().to_vec(),
            co_viewing: self.chat.logs().co_viewing().to_vec(),
            viewing: self.viewing.clone(),
            downloads: self
                .downloads
                .iter()
                .map(|(id, d)| (id.clone(), d.view()))
                .collect(),
        }
    }

    pub(crate) fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            tracing::trace!("notice dropped, nobody listening");
        }
    }

    pub(crate) fn notify_peers(&self) {
        self.notify(SessionNotice::PeersChanged(self.peer_views()));
    }
}

/// Cloneable handle for sending commands to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    /// Broadcasts a chat message in the current mode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SendChat(text.into())).await
    }

    /// Changes the local display name.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn set_username(&self, name: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetUsername(name.into())).await
    }

    /// Offers a file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Offer`] if the file cannot be inspected, or
    /// [`SessionError::Closed`] if the session has stopped.
    pub async fn offer_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|source| SessionError::Offer {
                path: path.clone(),
                source,
            })?;
        if !meta.is_file() {
            return Err(SessionError::Offer {
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        self.send(SessionCommand::OfferFile {
            name,
            size: meta.len(),
            source: Source::File(path),
        })
        .await
    }

    /// Offers bytes held in memory under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn offer_bytes(
        &self,
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<(), SessionError> {
        let data = data.into();
        self.send(SessionCommand::OfferFile {
            name: name.into(),
            size: data.len() as u64,
            source: Source::Memory(data),
        })
        .await
    }

    /// Starts downloading an offered file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn download(
        &self,
        file_msg_id: FileMsgId,
        target: Option<SinkTarget>,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Download {
            file_msg_id,
            target,
        })
        .await
    }

    /// Cancels a running download.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn cancel_download(&self, file_msg_id: FileMsgId) -> Result<(), SessionError> {
        self.send(SessionCommand::CancelDownload(file_msg_id)).await
    }

    /// Switches the chat mode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn set_mode(&self, mode: ChatMode) -> Result<(), SessionError> {
        self.send(SessionCommand::SetMode(mode)).await
    }

    /// Starts a viewing session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn start_viewing(&self, source: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::StartViewing(source.into())).await
    }

    /// Ends the viewing session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn stop_viewing(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopViewing).await
    }

    /// Sends a frame to every connected peer's viewing collaborator.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn send_co_viewing(&self, frame: CoViewingFrame) -> Result<(), SessionError> {
        self.send(SessionCommand::SendCoViewing(frame)).await
    }

    /// Fetches a snapshot of the session state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Says goodbye to every peer and stops the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session had already stopped.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Builds a session, starts it and spawns its loop.
///
/// # Errors
///
/// Returns [`SessionError::Transport`] if the connector cannot listen.
pub fn spawn(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
) -> Result<
    (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionNotice>,
        JoinHandle<()>,
    ),
    SessionError,
> {
    let (mut session, inbox, notices) = MeshSession::new(config, connector);
    session.start()?;
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(session.run(inbox, rx));
    Ok((SessionHandle { tx }, notices, task))
}
