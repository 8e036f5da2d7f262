// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

//! Integration tests for chunked file transfer between sessions.
//!
//! Offers spread over the mesh; downloads run on their own transfer link
//! straight to the offering peer.
//!
//! These tests validate:
//! - A guest downloads a host's file chunk by chunk into memory
//! - 5 MiB crosses the wire as chunks 0..4, one `file-end`, five acks and
//!   one `file-complete`
//! - Guests download from each other onto disk, with the partial file
//!   renamed on completion
//! - An unreachable offerer, a local cancel and a stalled sender each end
//!   the download with the matching reason
//! - Offered files start Ready; a canceled download can be restarted, and
//!   canceling twice finishes once
//! - Own and unknown files are refused
//!
//! Verification command: `cargo test --test file_transfer`

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meshchat::config::{ClientConfig, Role, TransferConfig};
use meshchat::session::{self, SessionHandle, SessionNotice, SessionSnapshot};
use meshchat::transfer::receiver::{Download, ReceiverInput, run_receiver};
use meshchat::transfer::sender::{SenderInput, Upload, run_sender};
use meshchat::transfer::{
    CancelReason, MemorySink, SenderOutcome, SinkTarget, Source, TransferStatus,
};
use meshchat::transport::{LinkCommand, LinkHandle};
use meshchat::transport::loopback::LoopbackNetwork;
use meshchat_proto::link::LinkPurpose;
use meshchat_proto::message::{Envelope, FileMsgId, FileOffer, PeerId, Timestamp};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

fn small_chunks() -> TransferConfig {
    TransferConfig {
        chunk_size: 1000,
        ..TransferConfig::default()
    }
}

fn host_config() -> ClientConfig {
    ClientConfig {
        transfer: small_chunks(),
        ..ClientConfig::default()
    }
}

fn guest_config(host: &str) -> ClientConfig {
    ClientConfig {
        role: Role::Guest {
            host: PeerId::new(host),
        },
        transfer: small_chunks(),
        ..ClientConfig::default()
    }
}

fn join(
    net: &LoopbackNetwork,
    id: &str,
    config: &ClientConfig,
) -> (SessionHandle, UnboundedReceiver<SessionNotice>) {
    let (handle, notices, _task) = session::spawn(config, Arc::new(net.connector(id))).unwrap();
    (handle, notices)
}

async fn wait_until(
    handle: &SessionHandle,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..2400 {
        let snapshot = handle.snapshot().await.expect("session alive");
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Waits for the offer named `name` and returns its id.
async fn offer_id(handle: &SessionHandle, name: &str) -> FileMsgId {
    let snapshot = wait_until(handle, "offer", |s| s.files().any(|f| f.file_name == name)).await;
    snapshot
        .files()
        .find(|f| f.file_name == name)
        .unwrap()
        .file_msg_id
        .clone()
}

async fn finished(handle: &SessionHandle, id: &FileMsgId) -> TransferStatus {
    wait_until(handle, "download finished", |s| {
        s.downloads.get(id).is_some_and(|d| d.status.is_terminal())
    })
    .await
    .downloads[id]
        .status
        .clone()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("meshchat-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn drain(notices: &mut UnboundedReceiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

// =============================================================================
// Successful transfers
// =============================================================================

#[tokio::test(start_paused = true)]
async fn guest_downloads_host_file_into_memory() {
    let net = LoopbackNetwork::new();
    let data = pattern(10_500);
    let (host, mut host_notices) = join(&net, "host", &host_config());
    let (guest, mut guest_notices) = join(&net, "g1", &guest_config("host"));
    wait_until(&guest, "named", |s| s.username == "Peer 1").await;

    host.offer_bytes("pattern.bin", data.clone()).await.unwrap();
    let id = offer_id(&guest, "pattern.bin").await;

    let sink = MemorySink::new();
    guest
        .download(id.clone(), Some(SinkTarget::Memory(sink.clone())))
        .await
        .unwrap();

    assert_eq!(finished(&guest, &id).await, TransferStatus::Completed);
    assert_eq!(sink.contents(), data);
    let view = &guest.snapshot().await.unwrap().downloads[&id];
    assert_eq!(view.received, 10_500);
    assert_eq!(view.total, 10_500);

    let progress: Vec<u64> = drain(&mut guest_notices)
        .into_iter()
        .filter_map(|n| match n {
            SessionNotice::TransferProgress {
                file_msg_id,
                received,
                ..
            } if file_msg_id == id => Some(received),
            _ => None,
        })
        .collect();
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&10_500));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    // The upload reports once the receiver confirms.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(drain(&mut host_notices).iter().any(|n| matches!(
        n,
        SessionNotice::UploadFinished { peer, outcome: SenderOutcome::Delivered, .. }
            if *peer == PeerId::new("g1")
    )));
}

#[tokio::test(start_paused = true)]
async fn five_mebibytes_arrive_in_five_chunks() {
    const MIB: u64 = 1024 * 1024;
    let net = LoopbackNetwork::new();
    let data = pattern(5 * 1024 * 1024);
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let guest_defaults = ClientConfig {
        role: Role::Guest {
            host: PeerId::new("host"),
        },
        ..ClientConfig::default()
    };
    let (guest, mut notices) = join(&net, "g1", &guest_defaults);
    wait_until(&guest, "named", |s| s.username == "Peer 1").await;

    host.offer_bytes("video.bin", data.clone()).await.unwrap();
    let id = offer_id(&guest, "video.bin").await;
    let sink = MemorySink::new();
    guest
        .download(id.clone(), Some(SinkTarget::Memory(sink.clone())))
        .await
        .unwrap();

    assert_eq!(finished(&guest, &id).await, TransferStatus::Completed);
    assert_eq!(sink.contents().len(), data.len());
    let progress: Vec<u64> = drain(&mut notices)
        .into_iter()
        .filter_map(|n| match n {
            SessionNotice::TransferProgress { received, .. } => Some(received),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, MIB, 2 * MIB, 3 * MIB, 4 * MIB, 5 * MIB]);
}

/// Every frame both ends put on the wire for one transfer.
#[derive(Debug, Default)]
struct WireLog {
    chunk_ids: Vec<u32>,
    file_ends: usize,
    acks: Vec<u32>,
    completes: usize,
    requests: usize,
}

#[tokio::test(start_paused = true)]
async fn five_mebibytes_cross_the_wire_as_five_chunks() {
    let fid = FileMsgId::new("video");
    let purpose = LinkPurpose::Transfer {
        file_msg_id: fid.clone(),
    };
    let data = pattern(5 * 1024 * 1024);
    let (to_receiver, mut sender_out, _) =
        LinkHandle::new(PeerId::new("receiver"), purpose.clone());
    let (to_sender, mut receiver_out, _) = LinkHandle::new(PeerId::new("sender"), purpose);
    let (sender_in, sender_rx) = mpsc::unbounded_channel();
    let (receiver_in, receiver_rx) = mpsc::unbounded_channel();
    let (reports, _report_rx) = mpsc::unbounded_channel();

    let sender = tokio::spawn(run_sender(
        Upload {
            file_msg_id: fid.clone(),
            source: Source::Memory(Arc::from(data.clone())),
            link: to_receiver,
            config: TransferConfig::default(),
        },
        sender_rx,
        CancellationToken::new(),
    ));
    let sink = MemorySink::new();
    let receiver = tokio::spawn(run_receiver(
        Download {
            offer: FileOffer {
                file_msg_id: fid,
                file_name: "video.bin".into(),
                file_size: data.len() as u64,
                sender_id: PeerId::new("sender"),
                username: "Host".into(),
                timestamp: Timestamp::from_millis(1),
                msg_id: None,
            },
            link: to_sender,
            target: SinkTarget::Memory(sink.clone()),
            stall_timeout: Duration::from_secs(20),
            reports,
        },
        receiver_rx,
        CancellationToken::new(),
    ));
    receiver_in.send(ReceiverInput::Opened).unwrap();

    let mut wire = WireLog::default();
    let (mut sender_open, mut receiver_open) = (true, true);
    while sender_open || receiver_open {
        tokio::select! {
            cmd = sender_out.recv(), if sender_open => match cmd {
                Some(LinkCommand::Frame(Envelope::FileChunk(chunk))) => {
                    wire.chunk_ids.push(chunk.chunk_id);
                    let _ = receiver_in.send(ReceiverInput::Chunk(chunk));
                }
                Some(LinkCommand::Frame(Envelope::FileEnd { .. })) => {
                    wire.file_ends += 1;
                    let _ = receiver_in.send(ReceiverInput::End);
                }
                Some(LinkCommand::Frame(other)) => panic!("sender sent {other:?}"),
                Some(LinkCommand::Close) | None => sender_open = false,
            },
            cmd = receiver_out.recv(), if receiver_open => match cmd {
                Some(LinkCommand::Frame(Envelope::FileRequest { .. })) => wire.requests += 1,
                Some(LinkCommand::Frame(Envelope::ChunkAck { chunk_id, .. })) => {
                    wire.acks.push(chunk_id);
                    let _ = sender_in.send(SenderInput::Ack(chunk_id));
                }
                Some(LinkCommand::Frame(Envelope::FileComplete { .. })) => {
                    wire.completes += 1;
                    let _ = sender_in.send(SenderInput::Complete);
                }
                Some(LinkCommand::Frame(other)) => panic!("receiver sent {other:?}"),
                Some(LinkCommand::Close) | None => receiver_open = false,
            },
        }
    }

    assert_eq!(sender.await.unwrap(), SenderOutcome::Delivered);
    assert_eq!(receiver.await.unwrap(), TransferStatus::Completed);
    assert_eq!(wire.requests, 1);
    assert_eq!(wire.chunk_ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(wire.file_ends, 1);
    assert_eq!(wire.acks.len(), 5);
    assert_eq!(
        wire.acks.iter().copied().collect::<BTreeSet<u32>>(),
        (0..5).collect()
    );
    assert_eq!(wire.completes, 1);
    assert_eq!(sink.contents(), data);
}

#[tokio::test]
async fn guests_transfer_to_disk_between_themselves() {
    let net = LoopbackNetwork::new();
    let data = pattern(4_321);
    let dir = scratch_dir("disk");
    let dest = dir.join("notes.txt");
    let _ = std::fs::remove_file(&dest);

    let (_host, _) = join(&net, "host", &host_config());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&g1, "g1 named", |s| s.username == "Peer 1").await;
    let (g2, _) = join(&net, "g2", &guest_config("host"));
    wait_until(&g2, "g2 named", |s| s.username == "Peer 2").await;

    g1.offer_bytes("notes.txt", data.clone()).await.unwrap();
    let id = offer_id(&g2, "notes.txt").await;
    g2.download(id.clone(), Some(SinkTarget::File(dest.clone())))
        .await
        .unwrap();

    assert_eq!(finished(&g2, &id).await, TransferStatus::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!dir.join("notes.txt.part").exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn empty_file_completes() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &host_config());
    let (guest, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&guest, "named", |s| s.username == "Peer 1").await;

    host.offer_bytes("empty.txt", Vec::<u8>::new()).await.unwrap();
    let id = offer_id(&guest, "empty.txt").await;
    let sink = MemorySink::new();
    guest
        .download(id.clone(), Some(SinkTarget::Memory(sink.clone())))
        .await
        .unwrap();

    assert_eq!(finished(&guest, &id).await, TransferStatus::Completed);
    assert!(sink.contents().is_empty());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn unreachable_offerer_cancels_with_connection() {
    let net = LoopbackNetwork::new();
    let (_host, _) = join(&net, "host", &host_config());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&g1, "g1 named", |s| s.username == "Peer 1").await;
    let (g2, _) = join(&net, "g2", &guest_config("host"));

    g1.offer_bytes("gone.bin", pattern(3000)).await.unwrap();
    let id = offer_id(&g2, "gone.bin").await;
    net.set_reachable(&PeerId::new("g1"), false);

    g2.download(id.clone(), Some(SinkTarget::Memory(MemorySink::new())))
        .await
        .unwrap();

    assert_eq!(
        finished(&g2, &id).await,
        TransferStatus::Canceled(CancelReason::Connection)
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_then_restart() {
    let net = LoopbackNetwork::new();
    let data = pattern(50_000);
    let (host, _) = join(&net, "host", &host_config());
    let (guest, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&guest, "named", |s| s.username == "Peer 1").await;

    host.offer_bytes("big.bin", data.clone()).await.unwrap();
    let id = offer_id(&guest, "big.bin").await;
    assert_eq!(
        guest.snapshot().await.unwrap().file_status(&id),
        Some(TransferStatus::Ready)
    );
    assert_eq!(host.snapshot().await.unwrap().file_status(&id), None);

    guest
        .download(id.clone(), Some(SinkTarget::Memory(MemorySink::new())))
        .await
        .unwrap();
    guest.cancel_download(id.clone()).await.unwrap();
    assert_eq!(
        finished(&guest, &id).await,
        TransferStatus::Canceled(CancelReason::User)
    );
    assert_eq!(
        guest.snapshot().await.unwrap().file_status(&id),
        Some(TransferStatus::Canceled(CancelReason::User))
    );

    let sink = MemorySink::new();
    guest
        .download(id.clone(), Some(SinkTarget::Memory(sink.clone())))
        .await
        .unwrap();
    assert_eq!(finished(&guest, &id).await, TransferStatus::Completed);
    assert_eq!(sink.contents(), data);
}

#[tokio::test(start_paused = true)]
async fn canceling_twice_finishes_once() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &host_config());
    let (guest, mut notices) = join(&net, "g1", &guest_config("host"));
    wait_until(&guest, "named", |s| s.username == "Peer 1").await;

    host.offer_bytes("big.bin", pattern(50_000)).await.unwrap();
    let id = offer_id(&guest, "big.bin").await;
    net.set_silent(&PeerId::new("host"), true);

    guest
        .download(id.clone(), Some(SinkTarget::Memory(MemorySink::new())))
        .await
        .unwrap();
    guest.cancel_download(id.clone()).await.unwrap();
    guest.cancel_download(id.clone()).await.unwrap();
    assert_eq!(
        finished(&guest, &id).await,
        TransferStatus::Canceled(CancelReason::User)
    );
    guest.cancel_download(id.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let endings: Vec<TransferStatus> = drain(&mut notices)
        .into_iter()
        .filter_map(|n| match n {
            SessionNotice::TransferFinished { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(endings, vec![TransferStatus::Canceled(CancelReason::User)]);
}

#[tokio::test(start_paused = true)]
async fn silent_sender_stalls_the_download() {
    let net = LoopbackNetwork::new();
    let (_host, _) = join(&net, "host", &host_config());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&g1, "g1 named", |s| s.username == "Peer 1").await;
    let (g2, _) = join(&net, "g2", &guest_config("host"));

    g1.offer_bytes("slow.bin", pattern(5000)).await.unwrap();
    let id = offer_id(&g2, "slow.bin").await;
    net.set_silent(&PeerId::new("g1"), true);

    g2.download(id.clone(), Some(SinkTarget::Memory(MemorySink::new())))
        .await
        .unwrap();

    assert_eq!(
        finished(&g2, &id).await,
        TransferStatus::Canceled(CancelReason::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn own_and_unknown_files_are_refused() {
    let net = LoopbackNetwork::new();
    let (host, mut notices) = join(&net, "host", &host_config());
    host.offer_bytes("mine.txt", b"mine".to_vec()).await.unwrap();
    let id = offer_id(&host, "mine.txt").await;

    host.download(id.clone(), None).await.unwrap();
    host.download(FileMsgId::new("no-such-file"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let failures: Vec<String> = drain(&mut notices)
        .into_iter()
        .filter_map(|n| match n {
            SessionNotice::CommandFailed(e) => Some(e.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures[0].contains("your own file"));
    assert!(failures[1].contains("unknown file"));
    assert!(host.snapshot().await.unwrap().downloads.is_empty());
}
