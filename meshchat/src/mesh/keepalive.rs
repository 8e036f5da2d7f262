//! Keep-alive sweep.
//!
//! Every tick the session asks [`sweep`] what to do with each Connected
//! peer: probe it with a `ping`, or give up on it because nothing has
//! arrived for longer than the stale threshold.

use std::time::Duration;

use tokio::time::Instant;

use meshchat_proto::message::PeerId;

use super::registry::{ConnectionRegistry, PeerStatus};

/// Outcome of a keep-alive sweep for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Still healthy; send a `ping`.
    Probe(PeerId),
    /// Silent for too long; treat the link as failed.
    Expire(PeerId),
}

/// Decides the keep-alive action for every Connected peer.
#[must_use]
pub fn sweep(
    registry: &ConnectionRegistry,
    now: Instant,
    stale_after: Duration,
) -> Vec<KeepAliveAction> {
    registry
        .iter()
        .filter(|r| r.status() == PeerStatus::Connected)
        .map(|r| {
            if r.is_stale(now, stale_after) {
                KeepAliveAction::Expire(r.peer_id().clone())
            } else {
                KeepAliveAction::Probe(r.peer_id().clone())
            }
        })
        .collect()
}
