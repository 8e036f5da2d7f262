//! Sending side of a file transfer.
//!
//! Chunks go out in order with at most `window_size` unacknowledged at
//! once. Each in-flight chunk has its own ack deadline; when it passes the
//! chunk is resent, and after `max_retries` resends the receiver is
//! declared unresponsive. Once every chunk is acknowledged the sender
//! emits `file-end` and keeps the link for a grace period so the
//! receiver's `file-complete` can arrive.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use meshchat_proto::message::{Envelope, FileChunk, FileMsgId};

use super::{SenderOutcome, Source};
use crate::config::TransferConfig;
use crate::transport::{LinkHandle, TransportError};

/// Error text sent when a chunk runs out of retries.
pub const RECEIVER_NOT_RESPONDING: &str = "Receiver not responding";

/// Messages the session routes to a running upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderInput {
    /// `chunk-ack` for one chunk.
    Ack(u32),
    /// `file-complete` from the receiver.
    Complete,
    /// `file-cancel` from the receiver.
    Cancel,
    /// The link closed.
    LinkClosed,
}

/// One upload to run.
#[derive(Debug)]
pub struct Upload {
    /// File being sent.
    pub file_msg_id: FileMsgId,
    /// Where the bytes come from.
    pub source: Source,
    /// Link to the receiver.
    pub link: LinkHandle,
    /// Chunking and retry parameters.
    pub config: TransferConfig,
}

struct InFlight {
    data: Vec<u8>,
    retries: u32,
    deadline: Instant,
}

/// Streams `upload` until it is delivered, canceled or fails.
///
/// A dedicated transfer link is closed when this returns; a mesh link is
/// left open.
pub async fn run_sender(
    upload: Upload,
    mut inputs: mpsc::UnboundedReceiver<SenderInput>,
    cancel: CancellationToken,
) -> SenderOutcome {
    let outcome = stream(&upload, &mut inputs, &cancel).await;
    tracing::info!(
        file = %upload.file_msg_id,
        peer = %upload.link.peer(),
        ?outcome,
        "upload finished"
    );
    if upload.link.purpose().is_transfer() {
        upload.link.close();
    }
    outcome
}

fn send_chunk(
    link: &LinkHandle,
    file_msg_id: &FileMsgId,
    chunk_id: u32,
    data: &[u8],
) -> Result<(), TransportError> {
    link.send(Envelope::FileChunk(FileChunk {
        file_msg_id: file_msg_id.clone(),
        chunk_id,
        data: data.to_vec(),
    }))
}

fn send_error(link: &LinkHandle, file_msg_id: &FileMsgId, error: &str) {
    if let Err(e) = link.send(Envelope::FileError {
        file_msg_id: file_msg_id.clone(),
        error: error.to_string(),
    }) {
        tracing::debug!(file = %file_msg_id, error = %e, "file-error not delivered");
    }
}

async fn stream(
    upload: &Upload,
    inputs: &mut mpsc::UnboundedReceiver<SenderInput>,
    cancel: &CancellationToken,
) -> SenderOutcome {
    let Upload {
        file_msg_id,
        source,
        link,
        config,
    } = upload;

    let mut reader = match source.open().await {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(file = %file_msg_id, error = %e, "cannot open offered file");
            send_error(link, file_msg_id, &e.to_string());
            return SenderOutcome::Failed(e.to_string());
        }
    };

    let window = config.window_size.max(1);
    let mut in_flight: BTreeMap<u32, InFlight> = BTreeMap::new();
    let mut next_id: u32 = 0;
    let mut exhausted = false;

    loop {
        while !exhausted && in_flight.len() < window {
            let data = match reader.next_chunk(config.chunk_size).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(file = %file_msg_id, error = %e, "read failed mid-transfer");
                    send_error(link, file_msg_id, &e.to_string());
                    return SenderOutcome::Failed(e.to_string());
                }
            };
            if data.is_empty() {
                exhausted = true;
                break;
            }
            if send_chunk(link, file_msg_id, next_id, &data).is_err() {
                return SenderOutcome::LinkLost;
            }
            in_flight.insert(
                next_id,
                InFlight {
                    data,
                    retries: 0,
                    deadline: Instant::now() + config.ack_timeout,
                },
            );
            next_id += 1;
        }

        let Some(deadline) = in_flight.values().map(|c| c.deadline).min() else {
            break;
        };

        tokio::select! {
            biased;

            () = cancel.cancelled() => return SenderOutcome::Canceled,

            input = inputs.recv() => match input {
                Some(SenderInput::Ack(chunk_id)) => {
                    if in_flight.remove(&chunk_id).is_none() {
                        tracing::trace!(file = %file_msg_id, chunk_id, "ack for unknown chunk");
                    }
                }
                Some(SenderInput::Complete) => {}
                Some(SenderInput::Cancel) => {
                    tracing::info!(file = %file_msg_id, "receiver canceled");
                    return SenderOutcome::Canceled;
                }
                Some(SenderInput::LinkClosed) | None => return SenderOutcome::LinkLost,
            },

            () = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                for (&chunk_id, chunk) in in_flight.iter_mut().filter(|(_, c)| c.deadline <= now) {
                    chunk.retries += 1;
                    if chunk.retries > config.max_retries {
                        tracing::warn!(file = %file_msg_id, chunk_id, "chunk out of retries");
                        send_error(link, file_msg_id, RECEIVER_NOT_RESPONDING);
                        return SenderOutcome::ReceiverUnresponsive;
                    }
                    tracing::debug!(file = %file_msg_id, chunk_id, retry = chunk.retries, "resending chunk");
                    if send_chunk(link, file_msg_id, chunk_id, &chunk.data).is_err() {
                        return SenderOutcome::LinkLost;
                    }
                    chunk.deadline = now + config.ack_timeout;
                }
            }
        }
    }

    if link
        .send(Envelope::FileEnd {
            file_msg_id: file_msg_id.clone(),
        })
        .is_err()
    {
        return SenderOutcome::LinkLost;
    }
    tracing::debug!(file = %file_msg_id, chunks = next_id, "all chunks acknowledged");

    let grace = tokio::time::sleep(config.close_grace);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return SenderOutcome::Canceled,

            input = inputs.recv() => match input {
                Some(SenderInput::Complete | SenderInput::LinkClosed) | None => break,
                Some(SenderInput::Ack(_)) => {}
                Some(SenderInput::Cancel) => return SenderOutcome::Canceled,
            },

            () = &mut grace => {
                tracing::debug!(file = %file_msg_id, "no file-complete within grace period");
                break;
            }
        }
    }
    SenderOutcome::Delivered
}
