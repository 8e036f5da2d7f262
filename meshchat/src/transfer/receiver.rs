//! Receiving side of a file transfer.
//!
//! The receiver asks for the file once its link opens, writes chunks into
//! the sink in arrival order and acknowledges each one. A stall timer is
//! re-armed on every chunk; if it fires the download is abandoned.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use meshchat_proto::message::{Envelope, FileChunk, FileOffer};

use super::{CancelReason, ReportKind, Sink, SinkTarget, TransferReport, TransferStatus};
use crate::transport::LinkHandle;

/// Messages the session routes to a running download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverInput {
    /// The transfer link finished opening.
    Opened,
    /// A `file-chunk` arrived.
    Chunk(FileChunk),
    /// `file-end` arrived.
    End,
    /// The sender reported an error or canceled.
    SenderError(String),
    /// The link closed.
    LinkClosed,
}

/// One download to run.
#[derive(Debug)]
pub struct Download {
    /// What is being fetched.
    pub offer: FileOffer,
    /// Transfer link to the offering peer.
    pub link: LinkHandle,
    /// Where the bytes go.
    pub target: SinkTarget,
    /// Longest wait for the next chunk.
    pub stall_timeout: Duration,
    /// Progress is reported here.
    pub reports: mpsc::UnboundedSender<TransferReport>,
}

enum Ending {
    Complete,
    Canceled(CancelReason),
}

/// Runs `download` to completion or cancellation and returns its final
/// status. The link is always closed on return.
pub async fn run_receiver(
    download: Download,
    mut inputs: mpsc::UnboundedReceiver<ReceiverInput>,
    cancel: CancellationToken,
) -> TransferStatus {
    let file = download.offer.file_msg_id.clone();
    let link = download.link.clone();

    let mut sink = match download.target.clone().open().await {
        Ok(sink) => sink,
        Err(e) => {
            tracing::warn!(file = %file, error = %e, "cannot open download target");
            link.close();
            return TransferStatus::Canceled(CancelReason::Error(e.to_string()));
        }
    };

    let status = match receive(&download, &mut sink, &mut inputs, &cancel).await {
        Ending::Complete => match sink.finish().await {
            Ok(()) => {
                if let Err(e) = link.send(Envelope::FileComplete {
                    file_msg_id: file.clone(),
                }) {
                    tracing::debug!(file = %file, error = %e, "file-complete not delivered");
                }
                TransferStatus::Completed
            }
            Err(e) => TransferStatus::Canceled(CancelReason::Error(e.to_string())),
        },
        Ending::Canceled(reason) => {
            sink.abort().await;
            TransferStatus::Canceled(reason)
        }
    };

    link.close();
    tracing::info!(file = %file, %status, "download finished");
    status
}

async fn receive(
    download: &Download,
    sink: &mut Sink,
    inputs: &mut mpsc::UnboundedReceiver<ReceiverInput>,
    cancel: &CancellationToken,
) -> Ending {
    let file = &download.offer.file_msg_id;
    let link = &download.link;
    let stall = tokio::time::sleep(download.stall_timeout);
    tokio::pin!(stall);

    let mut received: u64 = 0;
    let mut seen: HashSet<u32> = HashSet::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                if let Err(e) = link.send(Envelope::FileCancel { file_msg_id: file.clone() }) {
                    tracing::debug!(file = %file, error = %e, "file-cancel not delivered");
                }
                return Ending::Canceled(CancelReason::User);
            }

            input = inputs.recv() => match input {
                Some(ReceiverInput::Opened) => {
                    tracing::debug!(file = %file, peer = %link.peer(), "requesting file");
                    if link.send(Envelope::FileRequest { file_msg_id: file.clone() }).is_err() {
                        return Ending::Canceled(CancelReason::Connection);
                    }
                }
                Some(ReceiverInput::Chunk(chunk)) => {
                    if seen.insert(chunk.chunk_id) {
                        if let Err(e) = sink.write(&chunk.data).await {
                            tracing::warn!(file = %file, error = %e, "write failed");
                            return Ending::Canceled(CancelReason::Error(e.to_string()));
                        }
                        received += chunk.data.len() as u64;
                        let _ = download.reports.send(TransferReport {
                            file_msg_id: file.clone(),
                            link: link.id(),
                            kind: ReportKind::Progress { received },
                        });
                    } else {
                        tracing::debug!(file = %file, chunk_id = chunk.chunk_id, "duplicate chunk");
                    }
                    if let Err(e) = link.send(Envelope::ChunkAck {
                        file_msg_id: file.clone(),
                        chunk_id: chunk.chunk_id,
                    }) {
                        tracing::debug!(file = %file, error = %e, "ack not delivered");
                    }
                    stall.as_mut().reset(Instant::now() + download.stall_timeout);
                }
                Some(ReceiverInput::End) => return Ending::Complete,
                Some(ReceiverInput::SenderError(msg)) => {
                    tracing::warn!(file = %file, error = %msg, "sender aborted transfer");
                    return Ending::Canceled(CancelReason::Sender(msg));
                }
                Some(ReceiverInput::LinkClosed) | None => {
                    return Ending::Canceled(CancelReason::Connection);
                }
            },

            () = &mut stall => {
                tracing::warn!(file = %file, received, "transfer stalled");
                return Ending::Canceled(CancelReason::Timeout);
            }
        }
    }
}
