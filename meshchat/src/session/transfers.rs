//! Session side of file transfers: offers, requests and routing.
//!
//! Uploads are keyed by link and file, so one peer can serve the same file
//! to several downloaders at once. A file has at most one live download;
//! starting another cancels the first. Reports from a superseded task are
//! recognised by their link id and dropped.

use std::path::Path;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meshchat_proto::link::LinkPurpose;
use meshchat_proto::message::{Envelope, FileMsgId, FileOffer, MsgId, PeerId, Timestamp};

use super::{CommandError, DownloadView, MeshSession, SessionNotice};
use crate::transfer::receiver::{self, Download, ReceiverInput};
use crate::transfer::sender::{self, SenderInput, Upload};
use crate::transfer::{ReportKind, SinkTarget, Source, TransferReport, TransferStatus};
use crate::transport::{LinkHandle, LinkId};

/// Error text for a request naming a file this peer never offered.
pub const FILE_NOT_FOUND: &str = "File not found";

/// A running upload.
#[derive(Debug)]
pub(crate) struct UploadEntry {
    pub(crate) inputs: mpsc::UnboundedSender<SenderInput>,
    pub(crate) cancel: CancellationToken,
}

/// A download, running or finished.
#[derive(Debug)]
pub(crate) struct DownloadEntry {
    pub(crate) link: LinkId,
    pub(crate) file_name: String,
    pub(crate) inputs: mpsc::UnboundedSender<ReceiverInput>,
    pub(crate) cancel: CancellationToken,
    pub(crate) status: TransferStatus,
    pub(crate) received: u64,
    pub(crate) total: u64,
}

impl DownloadEntry {
    pub(crate) fn view(&self) -> DownloadView {
        DownloadView {
            file_name: self.file_name.clone(),
            status: self.status.clone(),
            received: self.received,
            total: self.total,
        }
    }
}

/// Keeps only the final path component of an offered name.
fn local_file_name(offered: &str) -> String {
    Path::new(offered)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

impl MeshSession {
    pub(super) fn offer_file(&mut self, name: String, size: u64, source: Source) {
        let now = Timestamp::now();
        let id = MsgId::generate(&self.local_id, now, rand::random::<u32>());
        let offer = FileOffer {
            file_msg_id: FileMsgId::new(id.as_str()),
            file_name: name,
            file_size: size,
            sender_id: self.local_id.clone(),
            username: self.username.clone(),
            timestamp: now,
            msg_id: None,
        }
        .normalized();

        self.chat.admit_file(&offer);
        self.offered.insert(offer.file_msg_id.clone(), source);
        let delivered = self.registry.broadcast(&Envelope::File(offer.clone()), &[]);
        tracing::info!(
            file = %offer.file_msg_id,
            name = %offer.file_name,
            size,
            delivered,
            "offering file"
        );
        self.notify(SessionNotice::FileOffered(offer));
    }

    pub(super) fn start_download(
        &mut self,
        file_msg_id: &FileMsgId,
        target: Option<SinkTarget>,
    ) -> Result<(), CommandError> {
        let offer = self
            .chat
            .logs()
            .find_file(file_msg_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownFile(file_msg_id.clone()))?;
        if offer.sender_id == self.local_id {
            return Err(CommandError::OwnFile(file_msg_id.clone()));
        }

        if let Some(previous) = self.downloads.get(file_msg_id)
            && !previous.status.is_terminal()
        {
            tracing::info!(file = %file_msg_id, "restarting download");
            previous.cancel.cancel();
        }

        let target = target.unwrap_or_else(|| {
            SinkTarget::File(self.download_dir.join(local_file_name(&offer.file_name)))
        });
        let link = self
            .connector
            .connect(
                &offer.sender_id,
                LinkPurpose::Transfer {
                    file_msg_id: file_msg_id.clone(),
                },
                self.link_tx.clone(),
            )
            .map_err(|e| CommandError::Unreachable {
                peer: offer.sender_id.clone(),
                reason: e.to_string(),
            })?;

        let (inputs, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link_id = link.id();
        let total = offer.file_size;
        let file_name = offer.file_name.clone();
        let download = Download {
            offer,
            link,
            target,
            stall_timeout: self.transfer.stall_timeout,
            reports: self.report_tx.clone(),
        };
        let reports = self.report_tx.clone();
        let id = file_msg_id.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let status = receiver::run_receiver(download, rx, token).await;
            let _ = reports.send(TransferReport {
                file_msg_id: id,
                link: link_id,
                kind: ReportKind::ReceiverDone(status),
            });
        });

        tracing::info!(file = %file_msg_id, %link_id, "download started");
        self.downloads.insert(
            file_msg_id.clone(),
            DownloadEntry {
                link: link_id,
                file_name,
                inputs,
                cancel,
                status: TransferStatus::Downloading,
                received: 0,
                total,
            },
        );
        self.notify(SessionNotice::TransferProgress {
            file_msg_id: file_msg_id.clone(),
            received: 0,
            total,
        });
        Ok(())
    }

    pub(super) fn cancel_download(&self, file_msg_id: &FileMsgId) {
        match self.downloads.get(file_msg_id) {
            Some(entry) if !entry.status.is_terminal() => {
                tracing::info!(file = %file_msg_id, "canceling download");
                entry.cancel.cancel();
            }
            _ => tracing::debug!(file = %file_msg_id, "nothing to cancel"),
        }
    }

    pub(super) fn accept_transfer_link(&mut self, handle: LinkHandle) {
        tracing::debug!(peer = %handle.peer(), link = %handle.id(), "transfer link accepted");
        self.transfer_links.insert(handle.id(), handle);
    }

    pub(super) fn transfer_link_opened(&self, link: LinkId) {
        if let Some(entry) = self.downloads.values().find(|d| d.link == link) {
            let _ = entry.inputs.send(ReceiverInput::Opened);
        }
    }

    pub(super) fn transfer_link_closed(&mut self, link: LinkId) {
        self.transfer_links.remove(&link);
        for ((upload_link, _), entry) in &self.uploads {
            if *upload_link == link {
                let _ = entry.inputs.send(SenderInput::LinkClosed);
            }
        }
        if let Some(entry) = self.downloads.values().find(|d| d.link == link) {
            let _ = entry.inputs.send(ReceiverInput::LinkClosed);
        }
    }

    pub(super) fn route_transfer(&mut self, link: LinkId, peer: &PeerId, envelope: Envelope) {
        match envelope {
            Envelope::FileRequest { file_msg_id } => self.serve_request(link, peer, file_msg_id),
            Envelope::ChunkAck {
                file_msg_id,
                chunk_id,
            } => self.to_upload(link, &file_msg_id, SenderInput::Ack(chunk_id)),
            Envelope::FileComplete { file_msg_id } => {
                self.to_upload(link, &file_msg_id, SenderInput::Complete);
            }
            Envelope::FileCancel { file_msg_id } => {
                if self.uploads.contains_key(&(link, file_msg_id.clone())) {
                    self.to_upload(link, &file_msg_id, SenderInput::Cancel);
                } else {
                    self.to_download(
                        link,
                        &file_msg_id,
                        ReceiverInput::SenderError("Sender canceled the transfer".into()),
                    );
                }
            }
            Envelope::FileChunk(chunk) => {
                let file_msg_id = chunk.file_msg_id.clone();
                self.to_download(link, &file_msg_id, ReceiverInput::Chunk(chunk));
            }
            Envelope::FileEnd { file_msg_id } => {
                self.to_download(link, &file_msg_id, ReceiverInput::End);
            }
            Envelope::FileError { file_msg_id, error } => {
                self.to_download(link, &file_msg_id, ReceiverInput::SenderError(error));
            }
            other => {
                tracing::debug!(peer = %peer, kind = other.type_name(), "not a transfer frame");
            }
        }
    }

    fn to_upload(&self, link: LinkId, file_msg_id: &FileMsgId, input: SenderInput) {
        match self.uploads.get(&(link, file_msg_id.clone())) {
            Some(entry) => {
                let _ = entry.inputs.send(input);
            }
            None => tracing::trace!(file = %file_msg_id, %link, "no upload for frame"),
        }
    }

    fn to_download(&self, link: LinkId, file_msg_id: &FileMsgId, input: ReceiverInput) {
        match self.downloads.get(file_msg_id) {
            Some(entry) if entry.link == link => {
                let _ = entry.inputs.send(input);
            }
            _ => tracing::trace!(file = %file_msg_id, %link, "no download for frame"),
        }
    }

    fn serve_request(&mut self, link: LinkId, peer: &PeerId, file_msg_id: FileMsgId) {
        let handle = match self.transfer_links.remove(&link) {
            Some(handle) => handle,
            None => match self
                .registry
                .get(peer)
                .filter(|r| r.owns(link))
                .and_then(|r| r.channel().cloned())
            {
                Some(handle) => handle,
                None => {
                    tracing::debug!(peer = %peer, %link, "request on unknown link");
                    return;
                }
            },
        };

        let Some(source) = self.offered.get(&file_msg_id).cloned() else {
            tracing::warn!(file = %file_msg_id, peer = %peer, "request for a file we do not offer");
            let _ = handle.send(Envelope::FileError {
                file_msg_id,
                error: FILE_NOT_FOUND.to_string(),
            });
            if handle.purpose().is_transfer() {
                handle.close();
            }
            return;
        };

        let key = (link, file_msg_id.clone());
        if self.uploads.contains_key(&key) {
            tracing::debug!(file = %file_msg_id, peer = %peer, "duplicate request");
            return;
        }

        let (inputs, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let upload = Upload {
            file_msg_id: file_msg_id.clone(),
            source,
            link: handle,
            config: self.transfer.clone(),
        };
        let reports = self.report_tx.clone();
        let downloader = peer.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = sender::run_sender(upload, rx, token).await;
            let _ = reports.send(TransferReport {
                file_msg_id,
                link,
                kind: ReportKind::SenderDone {
                    peer: downloader,
                    outcome,
                },
            });
        });
        tracing::info!(file = %key.1, peer = %peer, %link, "serving file");
        self.uploads.insert(key, UploadEntry { inputs, cancel });
    }

    pub(super) fn on_transfer_report(&mut self, report: TransferReport) {
        let TransferReport {
            file_msg_id,
            link,
            kind,
        } = report;
        match kind {
            ReportKind::Progress { received } => {
                if let Some(entry) = self
                    .downloads
                    .get_mut(&file_msg_id)
                    .filter(|d| d.link == link)
                {
                    entry.received = received;
                    let total = entry.total;
                    self.notify(SessionNotice::TransferProgress {
                        file_msg_id,
                        received,
                        total,
                    });
                }
            }
            ReportKind::ReceiverDone(status) => {
                if let Some(entry) = self
                    .downloads
                    .get_mut(&file_msg_id)
                    .filter(|d| d.link == link)
                {
                    entry.status = status.clone();
                    self.notify(SessionNotice::TransferFinished {
                        file_msg_id,
                        status,
                    });
                } else {
                    tracing::debug!(file = %file_msg_id, %link, "superseded download ended");
                }
            }
            ReportKind::SenderDone { peer, outcome } => {
                self.uploads.remove(&(link, file_msg_id.clone()));
                self.notify(SessionNotice::UploadFinished {
                    file_msg_id,
                    peer,
                    outcome,
                });
            }
        }
    }
}
