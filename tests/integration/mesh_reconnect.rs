// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for link health: keep-alive expiry, reconnect
//! backoff, goodbye handling and the end of a guest's session.
//!
//! The loopback hub can make a peer unreachable (new links fail) or silent
//! (its frames vanish while links stay open). Time is paused, so keep-alive
//! and backoff timers run on the virtual clock.
//!
//! These tests validate:
//! - A silent guest is expired by the host, then redialed with doubling
//!   delays until it answers, after which the delay resets
//! - Other guests learn about the outage through the host's user list
//! - A guest whose host disappears ends its session and is revived when
//!   the host dials it again
//! - A goodbye stops the host from redialing
//!
//! Verification command: `cargo test --test mesh_reconnect`

use std::sync::Arc;
use std::time::Duration;

use meshchat::config::{ClientConfig, Role};
use meshchat::session::{self, PeerView, SessionHandle, SessionNotice, SessionSnapshot};
use meshchat::transport::loopback::LoopbackNetwork;
use meshchat_proto::message::{PeerId, PeerStatusLabel};
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

/// Polls snapshots until `pred` holds; gives up after a minute of virtual time.
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

fn view<'a>(snapshot: &'a SessionSnapshot, peer: &str) -> Option<&'a PeerView> {
    snapshot.peer(&PeerId::new(peer))
}

fn status_is(snapshot: &SessionSnapshot, peer: &str, status: PeerStatusLabel) -> bool {
    view(snapshot, peer).is_some_and(|p| p.status == status)
}

fn drain(notices: &mut UnboundedReceiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// =============================================================================
// Keep-alive and backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn silent_guest_is_expired_and_redialed() {
    let net = LoopbackNetwork::new();
    let g1_id = PeerId::new("g1");
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (g1, mut g1_notices) = join(&net, "g1", &guest_config("host"));
    wait_until(&host, "g1 connected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;

    net.set_silent(&g1_id, true);
    net.set_reachable(&g1_id, false);

    let down = wait_until(&host, "g1 expired", |s| {
        status_is(s, "g1", PeerStatusLabel::Disconnected)
    })
    .await;
    let record = view(&down, "g1").unwrap();
    assert!(record.reconnect_pending);
    assert_eq!(record.backoff, Some(ms(2000)));

    wait_until(&g1, "guest session ended", |s| s.session_ended).await;

    // Failed redials keep doubling the delay.
    wait_until(&host, "backoff grew", |s| {
        view(s, "g1").is_some_and(|p| p.backoff >= Some(ms(8000)))
    })
    .await;

    net.set_silent(&g1_id, false);
    net.set_reachable(&g1_id, true);

    let back = wait_until(&host, "g1 reconnected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;
    let record = view(&back, "g1").unwrap();
    assert_eq!(record.backoff, Some(ms(1000)));
    assert!(!record.reconnect_pending);

    let resumed = wait_until(&g1, "guest session resumed", |s| !s.session_ended).await;
    assert_eq!(resumed.username, "Peer 1");
    assert!(
        drain(&mut g1_notices)
            .iter()
            .any(|n| matches!(n, SessionNotice::SessionEnded))
    );
}

#[tokio::test(start_paused = true)]
async fn other_guests_see_the_outage() {
    let net = LoopbackNetwork::new();
    let g1_id = PeerId::new("g1");
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (_g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&host, "g1 connected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;
    let (g2, _) = join(&net, "g2", &guest_config("host"));
    wait_until(&g2, "g2 sees g1", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;

    net.set_silent(&g1_id, true);
    net.set_reachable(&g1_id, false);
    wait_until(&g2, "g2 sees g1 drop", |s| {
        status_is(s, "g1", PeerStatusLabel::Disconnected)
    })
    .await;

    net.set_silent(&g1_id, false);
    net.set_reachable(&g1_id, true);
    wait_until(&g2, "g2 sees g1 return", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn healthy_links_survive_long_idle_periods() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&host, "g1 connected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;

    tokio::time::sleep(Duration::from_secs(60)).await;

    let snapshot = host.snapshot().await.unwrap();
    assert!(status_is(&snapshot, "g1", PeerStatusLabel::Connected));
    assert!(!g1.snapshot().await.unwrap().session_ended);
}

// =============================================================================
// Leaving
// =============================================================================

#[tokio::test(start_paused = true)]
async fn goodbye_stops_redialing() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (g1, _) = join(&net, "g1", &guest_config("host"));
    wait_until(&host, "g1 connected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
    })
    .await;

    g1.shutdown().await.unwrap();

    wait_until(&host, "g1 gone", |s| {
        status_is(s, "g1", PeerStatusLabel::Disconnected)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = host.snapshot().await.unwrap();
    let record = view(&snapshot, "g1").unwrap();
    assert_eq!(record.status, PeerStatusLabel::Disconnected);
    assert!(!record.reconnect_pending);
    assert!(g1.snapshot().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn host_leaving_ends_every_guest_session() {
    let net = LoopbackNetwork::new();
    let (host, _) = join(&net, "host", &ClientConfig::default());
    let (g1, mut g1_notices) = join(&net, "g1", &guest_config("host"));
    let (g2, _) = join(&net, "g2", &guest_config("host"));
    wait_until(&host, "guests connected", |s| {
        status_is(s, "g1", PeerStatusLabel::Connected)
            && status_is(s, "g2", PeerStatusLabel::Connected)
    })
    .await;

    host.shutdown().await.unwrap();

    for guest in [&g1, &g2] {
        let snapshot = wait_until(guest, "session ended", |s| s.session_ended).await;
        assert!(status_is(&snapshot, "host", PeerStatusLabel::SessionEnded));
        assert!(!view(&snapshot, "host").unwrap().reconnect_pending);
    }
    assert!(
        drain(&mut g1_notices)
            .iter()
            .any(|n| matches!(n, SessionNotice::SessionEnded))
    );
}

#[tokio::test(start_paused = true)]
async fn guest_without_a_host_ends_at_once() {
    let net = LoopbackNetwork::new();
    let (guest, _) = join(&net, "g1", &guest_config("nobody"));

    let snapshot = wait_until(&guest, "session ended", |s| s.session_ended).await;
    assert!(status_is(&snapshot, "nobody", PeerStatusLabel::SessionEnded));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!view(&guest.snapshot().await.unwrap(), "nobody").unwrap().reconnect_pending);
}
