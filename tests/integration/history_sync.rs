// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for history replay to late joiners.
//!
//! The host replays both chat logs and the active viewing session to every
//! peer it connects to. Replays go through the receiver's dedup ledger, so
//! reconnecting never duplicates entries.
//!
//! These tests validate:
//! - A late joiner receives earlier chats, file offers, co-viewing chat and
//!   the viewing session
//! - Chat from other guests is part of the replay
//! - A replay after reconnecting adds nothing
//! - An ended viewing session is not replayed
//!
//! Verification command: `cargo test --test history_sync`

use std::sync::Arc;
use std::time::Duration;

use meshchat::config::{ClientConfig, Role};
use meshchat::session::{self, SessionHandle, SessionNotice, SessionSnapshot};
use meshchat::transport::loopback::LoopbackNetwork;
use meshchat_proto::message::{ChatMode, LogEntry, PeerId, PeerStatusLabel};
use tokio::sync::mpsc::UnboundedReceiver;

// =============================================================================
// Helpers
// =============================================================================

fn guest_config(host: &str) -> ClientConfig {
    ClientConfig {
        role: Role::Guest {
            host: PeerId::new(host),
        },
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

fn texts(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot.normal_chats().map(|m| m.text.clone()).collect()
}

fn drain(notices: &mut UnboundedReceiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

// =============================================================================
// Replay
// =============================================================================

#[tokio::test(start_paused = true)]
async fn late_joiner_receives_everything_so_far() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());

    host.send_chat("before anyone").await.unwrap();
    host.offer_bytes("agenda.txt", b"1. intro\n2. demo\n".to_vec())
        .await
        .unwrap();
    host.start_viewing("talk.mp4").await.unwrap();
    host.set_mode(ChatMode::CoViewing).await.unwrap();
    host.send_chat("starting now").await.unwrap();
    wait_until(&host, "host logs filled", |s| {
        s.normal.len() == 2 && s.co_viewing.len() == 1
    })
    .await;

    let (guest, mut notices) = join(&net, "g1", &guest_config("host"));
    let snapshot = wait_until(&guest, "history merged", |s| {
        s.normal.len() == 2 && s.co_viewing.len() == 1 && s.viewing.is_some()
    })
    .await;

    assert_eq!(texts(&snapshot), vec!["before anyone".to_string()]);
    let offer = snapshot.files().next().unwrap();
    assert_eq!(offer.file_name, "agenda.txt");
    assert_eq!(offer.file_size, 17);
    assert_eq!(offer.sender_id, PeerId::new("host"));
    assert!(offer.msg_id.is_some());
    assert_eq!(snapshot.co_viewing[0].text, "starting now");
    assert_eq!(snapshot.viewing.as_ref().unwrap().source, "talk.mp4");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = drain(&mut notices);
    assert!(seen.iter().any(|n| matches!(
        n,
        SessionNotice::HistoryMerged {
            normal_added: 2,
            co_viewing_added: 1
        }
    )));
    assert!(
        seen.iter()
            .any(|n| matches!(n, SessionNotice::FileOffered(o) if o.file_name == "agenda.txt"))
    );
}

#[tokio::test(start_paused = true)]
async fn replay_includes_other_guests_chat() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&g1, "g1 named", |s| s.username == "Peer 1").await;

    g1.send_chat("first!").await.unwrap();
    wait_until(&host, "guest chat relayed", |s| texts(s).len() == 1).await;
    host.send_chat("hi Peer 1").await.unwrap();
    wait_until(&host, "host has both", |s| texts(s).len() == 2).await;

    let (g2, _) = join(&net, "g2", &guest_config("host"));
    let snapshot = wait_until(&g2, "replayed chat", |s| texts(s).len() == 2).await;
    assert_eq!(
        texts(&snapshot),
        vec!["first!".to_string(), "hi Peer 1".to_string()]
    );
    let authors: Vec<&str> = snapshot
        .normal_chats()
        .map(|m| m.username.as_str())
        .collect();
    assert_eq!(authors, vec!["Peer 1", "Host"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replay_adds_nothing() {
    let net = LoopbackNetwork::new();
    let g1_id = PeerId::new("g1");
    let (host, _) = join(&net, "host", &ClientConfig::default());
    host.send_chat("one").await.unwrap();
    host.offer_bytes("a.bin", vec![7u8; 32]).await.unwrap();

    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&g1, "first replay", |s| s.normal.len() == 2).await;
    g1.send_chat("two").await.unwrap();
    wait_until(&host, "guest chat relayed", |s| texts(s).len() == 2).await;

    net.set_silent(&g1_id, true);
    wait_until(&g1, "session ended", |s| s.session_ended).await;
    net.set_silent(&g1_id, false);
    wait_until(&host, "g1 back", |s| {
        s.peer(&g1_id)
            .is_some_and(|p| p.status == PeerStatusLabel::Connected)
    })
    .await;
    wait_until(&g1, "session resumed", |s| !s.session_ended).await;

    // Give the second replay time to land.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = g1.snapshot().await.unwrap();
    assert_eq!(snapshot.normal.len(), 3);
    assert_eq!(snapshot.files().count(), 1);
    assert_eq!(
        texts(&snapshot),
        vec!["one".to_string(), "two".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn ended_viewing_is_not_replayed() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());
    host.start_viewing("old.mp4").await.unwrap();
    host.set_mode(ChatMode::CoViewing).await.unwrap();
    host.send_chat("side talk").await.unwrap();
    host.stop_viewing().await.unwrap();
    host.send_chat("back to normal").await.unwrap();

    let (guest, _) = join(&net, "g1", &guest_config("host"));
    let snapshot = wait_until(&guest, "replay", |s| !s.normal.is_empty()).await;

    assert!(snapshot.viewing.is_none());
    assert!(snapshot.co_viewing.is_empty());
    assert!(matches!(
        &snapshot.normal[0],
        LogEntry::Chat(msg) if msg.text == "back to normal" && msg.chat_mode == ChatMode::Normal
    ));
}
