//! Wire format message types for the meshchat protocol.
//!
//! Every record exchanged between peers is an [`Envelope`]. The envelope
//! variant is the record's `type` discriminator; [`Envelope::type_name`]
//! returns the canonical name used in logs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum allowed chat text size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum display name length in characters.
pub const MAX_USERNAME_CHARS: usize = 20;

/// Prefix used when synthesizing a ledger id for a file offer.
const FILE_MSG_ID_PREFIX: &str = "filemsg-";

/// Opaque peer identity handed out by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique message identifier: `{sender}-{millis}-{random}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds a fresh identifier for a message originated by `sender`.
    ///
    /// `nonce` is rendered as six lowercase hex digits.
    #[must_use]
    pub fn generate(sender: &PeerId, at: Timestamp, nonce: u32) -> Self {
        Self(format!(
            "{sender}-{}-{:06x}",
            at.as_millis(),
            nonce & 0x00ff_ffff
        ))
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an offered file, shared by the chat entry and every
/// transfer record for that file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMsgId(String);

impl FileMsgId {
    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileMsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Which of the two chat logs a message belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatMode {
    /// The regular session chat.
    #[default]
    Normal,
    /// Side chat attached to a shared-viewing session.
    CoViewing,
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::CoViewing => write!(f, "co-viewing"),
        }
    }
}

/// Connection status of a peer as shown in roster snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatusLabel {
    /// Link is open and healthy.
    Connected,
    /// A connection attempt is in progress.
    Connecting,
    /// No live link.
    Disconnected,
    /// The guest's upstream host went away; the session is over.
    SessionEnded,
}

impl fmt::Display for PeerStatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::SessionEnded => write!(f, "Session Ended"),
        }
    }
}

/// A chat message as relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier; decides admission through the dedup ledger.
    pub msg_id: MsgId,
    /// Peer that originally wrote the message.
    pub sender_id: PeerId,
    /// Message body.
    pub text: String,
    /// Display name of the author at send time.
    pub username: String,
    /// When the author sent it.
    pub timestamp: Timestamp,
    /// Colour derived from the author's name.
    pub display_color: String,
    /// Target log.
    pub chat_mode: ChatMode,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message has no identifier.
    #[error("message has no id")]
    MissingId,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl ChatMessage {
    /// Validates this message against `max_size` bytes of text.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for blank text,
    /// [`ValidationError::MissingId`] for an empty id, and
    /// [`ValidationError::TooLarge`] when the text exceeds `max_size`.
    pub fn validate(&self, max_size: usize) -> Result<(), ValidationError> {
        if self.msg_id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.text.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.text.len();
        if size > max_size {
            return Err(ValidationError::TooLarge {
                size,
                max: max_size,
            });
        }
        Ok(())
    }
}

/// Announcement of a file one peer offers for download.
///
/// Persisted in the normal chat log. Older peers may omit `msg_id`; use
/// [`FileOffer::ledger_id`] to get a usable identifier either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    /// Transfer-level identifier.
    pub file_msg_id: FileMsgId,
    /// Original file name.
    pub file_name: String,
    /// Size in bytes.
    pub file_size: u64,
    /// Peer holding the file.
    pub sender_id: PeerId,
    /// Display name of the offering peer.
    pub username: String,
    /// When the offer was made.
    pub timestamp: Timestamp,
    /// Ledger identifier, if the offering peer set one.
    pub msg_id: Option<MsgId>,
}

impl FileOffer {
    /// Identifier used for dedup: the explicit id, or one derived from
    /// the file id.
    #[must_use]
    pub fn ledger_id(&self) -> MsgId {
        self.msg_id
            .clone()
            .unwrap_or_else(|| MsgId::new(format!("{FILE_MSG_ID_PREFIX}{}", self.file_msg_id)))
    }

    /// Returns a copy carrying an explicit ledger id.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            msg_id: Some(self.ledger_id()),
            ..self.clone()
        }
    }
}

/// One entry of the normal chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A text message.
    Chat(ChatMessage),
    /// A file announcement.
    File(FileOffer),
}

impl LogEntry {
    /// Ledger identifier of this entry.
    #[must_use]
    pub fn ledger_id(&self) -> MsgId {
        match self {
            Self::Chat(msg) => msg.msg_id.clone(),
            Self::File(offer) => offer.ledger_id(),
        }
    }
}

/// Descriptor of a shared-viewing session. The source is opaque to the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewingSession {
    /// Whether the session is running.
    pub active: bool,
    /// Peer hosting the playback.
    pub host_id: PeerId,
    /// Media source descriptor understood by the media collaborator.
    pub source: String,
    /// Identifier of this viewing session.
    pub session_id: String,
}

/// Host → new peer: assigns a default display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignName {
    /// The assigned name.
    pub username: String,
    /// The peer receiving the name.
    pub peer_id: PeerId,
    /// Status of every known peer at assignment time.
    pub all_statuses: BTreeMap<PeerId, PeerStatusLabel>,
}

/// Identity announcement or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameUpdate {
    /// New display name.
    pub username: String,
    /// Peer the name belongs to; the link's peer when absent.
    pub peer_id: Option<PeerId>,
    /// Ask the host to answer with a roster snapshot.
    pub req_user_list: bool,
}

/// Host → peers: authoritative roster snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    /// Display name per peer.
    pub users: BTreeMap<PeerId, String>,
    /// Connection status per peer.
    pub statuses: BTreeMap<PeerId, PeerStatusLabel>,
}

/// Host → newly joined peer: everything said so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBundle {
    /// The normal log, file entries normalized.
    pub normal: Vec<LogEntry>,
    /// The co-viewing log.
    pub co_viewing: Vec<ChatMessage>,
    /// Active shared-viewing session, if any.
    pub viewing: Option<ViewingSession>,
}

/// One chunk of a file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// File this chunk belongs to.
    pub file_msg_id: FileMsgId,
    /// Zero-based chunk index.
    pub chunk_id: u32,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChunk")
            .field("file_msg_id", &self.file_msg_id)
            .field("chunk_id", &self.chunk_id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Opaque frame belonging to the media collaborator's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoViewingFrame {
    /// Sub-type within the collaborator's namespace (e.g. `binge-sync`).
    pub kind: String,
    /// Collaborator-defined payload.
    pub payload: Vec<u8>,
}

/// Top-level envelope wrapping all wire-level protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Keep-alive probe.
    Ping,
    /// Keep-alive reply.
    Pong,
    /// Host assigns a default name.
    AssignName(AssignName),
    /// Identity announcement.
    Username(UsernameUpdate),
    /// Roster snapshot.
    UserList(UserList),
    /// Chat relay.
    Chat(ChatMessage),
    /// One-shot history replay.
    History(HistoryBundle),
    /// Graceful departure notice.
    Goodbye {
        /// The departing peer.
        peer_id: PeerId,
    },
    /// File announcement.
    File(FileOffer),
    /// Receiver → sender: start streaming.
    FileRequest {
        /// Requested file.
        file_msg_id: FileMsgId,
    },
    /// Sender → receiver: one chunk.
    FileChunk(FileChunk),
    /// Receiver → sender: chunk received.
    ChunkAck {
        /// File the chunk belongs to.
        file_msg_id: FileMsgId,
        /// Acknowledged chunk.
        chunk_id: u32,
    },
    /// Sender → receiver: every chunk was acknowledged.
    FileEnd {
        /// Finished file.
        file_msg_id: FileMsgId,
    },
    /// Receiver → sender: sink closed successfully.
    FileComplete {
        /// Finished file.
        file_msg_id: FileMsgId,
    },
    /// Either direction: abort the transfer.
    FileCancel {
        /// Canceled file.
        file_msg_id: FileMsgId,
    },
    /// Sender → receiver: fatal transfer failure.
    FileError {
        /// Failed file.
        file_msg_id: FileMsgId,
        /// Human-readable reason.
        error: String,
    },
    /// Shared-viewing session announcement (active or ended).
    SessionInfo(ViewingSession),
    /// Media collaborator frame, passed through untouched.
    CoViewing(CoViewingFrame),
}

impl Envelope {
    /// Canonical `type` name of this record.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::AssignName(_) => "assignName",
            Self::Username(_) => "username",
            Self::UserList(_) => "userlist",
            Self::Chat(_) => "chat",
            Self::History(_) => "history",
            Self::Goodbye { .. } => "goodbye",
            Self::File(_) => "file",
            Self::FileRequest { .. } => "file-request",
            Self::FileChunk(_) => "file-chunk",
            Self::ChunkAck { .. } => "chunk-ack",
            Self::FileEnd { .. } => "file-end",
            Self::FileComplete { .. } => "file-complete",
            Self::FileCancel { .. } => "file-cancel",
            Self::FileError { .. } => "file-error",
            Self::SessionInfo(_) => "session-info",
            Self::CoViewing(_) => "co-viewing",
        }
    }

    /// The file a transfer sub-protocol record refers to.
    ///
    /// Returns `None` for everything outside the transfer sub-protocol,
    /// including the `file` announcement itself.
    #[must_use]
    pub const fn transfer_file_id(&self) -> Option<&FileMsgId> {
        match self {
            Self::FileRequest { file_msg_id }
            | Self::ChunkAck { file_msg_id, .. }
            | Self::FileEnd { file_msg_id }
            | Self::FileComplete { file_msg_id }
            | Self::FileCancel { file_msg_id }
            | Self::FileError { file_msg_id, .. }
            | Self::FileChunk(FileChunk { file_msg_id, .. }) => Some(file_msg_id),
            _ => None,
        }
    }
}
