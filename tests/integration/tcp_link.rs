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

//! Integration tests running sessions over real TCP sockets on localhost.
//!
//! Each participant's peer id is its `127.0.0.1:<port>` listen address.
//!
//! These tests validate:
//! - A guest joins a host, is named, and chat flows both ways
//! - A file offer is downloaded over its own TCP connection
//!
//! Verification command: `cargo test --test tcp_link`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshchat::config::{ClientConfig, Role};
use meshchat::session::{self, SessionHandle, SessionSnapshot};
use meshchat::transfer::{MemorySink, SinkTarget, TransferStatus};
use meshchat::transport::tcp::TcpConnector;
use meshchat_proto::message::PeerId;

// =============================================================================
// Helpers
// =============================================================================

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn start(config: ClientConfig) -> SessionHandle {
    let connector = TcpConnector::new(config.listen, None, config.connect_timeout);
    let (handle, _notices, _task) = session::spawn(&config, Arc::new(connector)).unwrap();
    handle
}

fn host_at(addr: SocketAddr) -> SessionHandle {
    start(ClientConfig {
        listen: addr,
        ..ClientConfig::default()
    })
}

fn guest_at(addr: SocketAddr, host: SocketAddr) -> SessionHandle {
    start(ClientConfig {
        role: Role::Guest {
            host: PeerId::new(host.to_string()),
        },
        listen: addr,
        ..ClientConfig::default()
    })
}

async fn wait_until(
    handle: &SessionHandle,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..800 {
        let snapshot = handle.snapshot().await.expect("session alive");
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn guest_joins_and_chats_over_tcp() {
    let host_addr = free_addr();
    let guest_addr = free_addr();
    let host = host_at(host_addr);
    let guest = guest_at(guest_addr, host_addr);

    wait_until(&guest, "guest named", |s| s.username == "Peer 1").await;
    assert_eq!(
        host.snapshot()
            .await
            .unwrap()
            .peer(&PeerId::new(guest_addr.to_string()))
            .unwrap()
            .name,
        "Peer 1"
    );

    guest.send_chat("over the wire").await.unwrap();
    let snapshot = wait_until(&host, "chat at host", |s| s.normal_chats().count() == 1).await;
    assert_eq!(snapshot.normal_chats().next().unwrap().text, "over the wire");

    host.send_chat("loud and clear").await.unwrap();
    wait_until(&guest, "reply at guest", |s| s.normal_chats().count() == 2).await;

    guest.shutdown().await.unwrap();
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn file_download_over_tcp() {
    let host_addr = free_addr();
    let guest_addr = free_addr();
    let host = host_at(host_addr);
    let guest = guest_at(guest_addr, host_addr);
    wait_until(&guest, "guest named", |s| s.username == "Peer 1").await;

    let data: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 253) as u8).collect();
    host.offer_bytes("blob.bin", data.clone()).await.unwrap();
    let snapshot = wait_until(&guest, "offer", |s| s.files().count() == 1).await;
    let id = snapshot.files().next().unwrap().file_msg_id.clone();

    let sink = MemorySink::new();
    guest
        .download(id.clone(), Some(SinkTarget::Memory(sink.clone())))
        .await
        .unwrap();
    wait_until(&guest, "download complete", |s| {
        s.downloads
            .get(&id)
            .is_some_and(|d| d.status == TransferStatus::Completed)
    })
    .await;
    assert_eq!(sink.contents(), data);

    guest.shutdown().await.unwrap();
    host.shutdown().await.unwrap();
}
