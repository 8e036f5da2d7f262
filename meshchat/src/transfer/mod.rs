//! Chunked file transfer.
//!
//! Each transfer runs as its own task: [`sender::run_sender`] streams an
//! offered file over a link with a sliding window of unacknowledged
//! chunks, and [`receiver::run_receiver`] writes what arrives into a
//! sink, acknowledging every chunk. Both report back to the session
//! through [`TransferReport`]s and stop on their cancellation token.

pub mod receiver;
pub mod sender;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use meshchat_proto::message::{FileMsgId, PeerId};

use crate::transport::LinkId;

/// Errors raised by transfer sources and sinks.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The offered file could not be opened or read.
    #[error("cannot read {path}: {source}")]
    Source {
        /// File being offered.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The download target could not be created.
    #[error("cannot create {path}: {source}")]
    SinkUnavailable {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Writing or finishing the download failed.
    #[error("write error: {0}")]
    Write(#[from] io::Error),
}

/// Why a download ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The local user canceled.
    User,
    /// The link closed mid-transfer.
    Connection,
    /// No chunk arrived within the stall timeout.
    Timeout,
    /// The sender reported an error.
    Sender(String),
    /// A local error, such as a failed write.
    Error(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "canceled by you"),
            Self::Connection => write!(f, "connection lost"),
            Self::Timeout => write!(f, "timeout waiting for next chunk"),
            Self::Sender(msg) => write!(f, "sender: {msg}"),
            Self::Error(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Receiver-side state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Offered, not requested.
    Ready,
    /// Chunks are arriving.
    Downloading,
    /// Every byte was written and the sink closed.
    Completed,
    /// Ended early.
    Canceled(CancelReason),
}

impl TransferStatus {
    /// Whether the transfer is over.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled(_))
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Canceled(reason) => write!(f, "canceled ({reason})"),
        }
    }
}

/// How an upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderOutcome {
    /// Every chunk was acknowledged and `file-end` sent.
    Delivered,
    /// The receiver or the local session canceled.
    Canceled,
    /// A chunk ran out of retries.
    ReceiverUnresponsive,
    /// The link closed before the transfer finished.
    LinkLost,
    /// Reading the source failed.
    Failed(String),
}

/// Progress and completion messages from transfer tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// File concerned.
    pub file_msg_id: FileMsgId,
    /// Link the task runs on; stale reports are recognised by it.
    pub link: LinkId,
    /// What happened.
    pub kind: ReportKind,
}

/// Payload of a [`TransferReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    /// Bytes written so far.
    Progress {
        /// Bytes received.
        received: u64,
    },
    /// The download ended.
    ReceiverDone(TransferStatus),
    /// The upload ended.
    SenderDone {
        /// Peer that was downloading.
        peer: PeerId,
        /// How it ended.
        outcome: SenderOutcome,
    },
}

/// Where an offered file's bytes come from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A file on disk, opened per request.
    File(PathBuf),
    /// Bytes held in memory.
    Memory(Arc<[u8]>),
}

impl Source {
    /// Opens a sequential reader.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Source`] if the file cannot be opened.
    pub async fn open(&self) -> Result<SourceReader, TransferError> {
        match self {
            Self::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| TransferError::Source {
                        path: path.clone(),
                        source,
                    })?;
                Ok(SourceReader::File(file))
            }
            Self::Memory(data) => Ok(SourceReader::Memory {
                data: Arc::clone(data),
                pos: 0,
            }),
        }
    }
}

/// Sequential chunk reader over a [`Source`].
#[derive(Debug)]
pub enum SourceReader {
    /// Reading from disk.
    File(tokio::fs::File),
    /// Reading from memory.
    Memory {
        /// The bytes.
        data: Arc<[u8]>,
        /// Next unread offset.
        pos: usize,
    },
}

impl SourceReader {
    /// Reads up to `chunk_size` bytes. An empty vector means end of file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::File(file) => {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < chunk_size {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            Self::Memory { data, pos } => {
                let end = (*pos + chunk_size).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                Ok(chunk)
            }
        }
    }
}

/// In-memory download target whose contents stay inspectable.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

/// Where a download goes.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// A file path; written to `<path>.part` and renamed on completion.
    File(PathBuf),
    /// A shared buffer.
    Memory(MemorySink),
}

impl SinkTarget {
    /// Opens the target for writing.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::SinkUnavailable`] if the file cannot be
    /// created.
    pub async fn open(self) -> Result<Sink, TransferError> {
        match self {
            Self::File(path) => {
                let partial = partial_path(&path);
                let file = tokio::fs::File::create(&partial).await.map_err(|source| {
                    TransferError::SinkUnavailable {
                        path: partial.clone(),
                        source,
                    }
                })?;
                Ok(Sink::File {
                    file,
                    partial,
                    path,
                })
            }
            Self::Memory(sink) => {
                sink.0.lock().clear();
                Ok(Sink::Memory(sink))
            }
        }
    }
}

fn partial_path(path: &std::path::Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// An open download target.
#[derive(Debug)]
pub enum Sink {
    /// Writing to a temporary file.
    File {
        /// Open handle on the temporary file.
        file: tokio::fs::File,
        /// Temporary path.
        partial: PathBuf,
        /// Final path.
        path: PathBuf,
    },
    /// Writing to memory.
    Memory(MemorySink),
}

impl Sink {
    /// Appends bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        match self {
            Self::File { file, .. } => file.write_all(data).await?,
            Self::Memory(sink) => sink.0.lock().extend_from_slice(data),
        }
        Ok(())
    }

    /// Flushes and moves the file into place.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn finish(self) -> Result<(), TransferError> {
        if let Self::File {
            mut file,
            partial,
            path,
        } = self
        {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial, &path).await?;
        }
        Ok(())
    }

    /// Discards whatever was written.
    pub async fn abort(self) {
        match self {
            Self::File { file, partial, .. } => {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    tracing::debug!(path = %partial.display(), error = %e, "partial file not removed");
                }
            }
            Self::Memory(sink) => sink.0.lock().clear(),
        }
    }
}

/// Human-readable byte count: `B`, `KB`, `MB` or `GB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1} MB", b as f64 / MB as f64),
        b => format!("{:.2} GB", b as f64 / GB as f64),
    }
}
