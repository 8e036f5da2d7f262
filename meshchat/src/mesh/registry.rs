//! Per-peer connection records.
//!
//! The registry owns every peer's link handle and reconnect timer. Records
//! are created on the first inbound or outbound attempt and never removed;
//! a disconnected peer keeps its record so a later link revives it in place.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use meshchat_proto::message::{Envelope, PeerId, PeerStatusLabel};

use super::backoff::Backoff;
use crate::transport::{LinkHandle, LinkId};

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// A link is being opened.
    Connecting,
    /// The link is open and traffic is flowing.
    Connected,
    /// No usable link.
    Disconnected,
}

impl From<PeerStatus> for PeerStatusLabel {
    fn from(status: PeerStatus) -> Self {
        match status {
            PeerStatus::Connecting => Self::Connecting,
            PeerStatus::Connected => Self::Connected,
            PeerStatus::Disconnected => Self::Disconnected,
        }
    }
}

/// Everything known about one remote peer's link.
#[derive(Debug)]
pub struct PeerRecord {
    peer_id: PeerId,
    channel: Option<LinkHandle>,
    status: PeerStatus,
    backoff: Backoff,
    last_activity: Instant,
    pending_reconnect: Option<AbortHandle>,
    departed: bool,
}

impl PeerRecord {
    fn new(peer_id: PeerId, backoff: Backoff, now: Instant) -> Self {
        Self {
            peer_id,
            channel: None,
            status: PeerStatus::Connecting,
            backoff,
            last_activity: now,
            pending_reconnect: None,
            departed: false,
        }
    }

    /// The peer this record describes.
    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> PeerStatus {
        self.status
    }

    /// Current reconnect delay.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff.current()
    }

    /// Instant of the last received traffic.
    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Whether a retry timer is outstanding.
    #[must_use]
    pub const fn has_pending_reconnect(&self) -> bool {
        self.pending_reconnect.is_some()
    }

    /// Whether the peer said goodbye.
    #[must_use]
    pub const fn departed(&self) -> bool {
        self.departed
    }

    /// The live link, if any.
    #[must_use]
    pub const fn channel(&self) -> Option<&LinkHandle> {
        self.channel.as_ref()
    }

    /// Whether the record holds a link that has not been closed.
    #[must_use]
    pub fn has_open_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Whether `link` is this record's current link.
    #[must_use]
    pub fn owns(&self, link: LinkId) -> bool {
        self.channel.as_ref().is_some_and(|c| c.id() == link)
    }

    /// Installs a new link while it opens, replacing any previous one.
    pub fn attach(&mut self, channel: LinkHandle, now: Instant) {
        if let Some(old) = self.channel.replace(channel)
            && !self.owns(old.id())
        {
            old.close();
        }
        self.status = PeerStatus::Connecting;
        self.last_activity = now;
        self.departed = false;
    }

    /// Marks the link open: Connected, backoff reset, retry canceled.
    pub fn mark_open(&mut self, now: Instant) {
        self.status = PeerStatus::Connected;
        self.backoff.reset();
        self.last_activity = now;
        self.cancel_reconnect();
    }

    /// Marks the peer Disconnected and closes its link.
    pub fn mark_down(&mut self) {
        self.status = PeerStatus::Disconnected;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    /// Marks the peer as having left on purpose.
    pub fn mark_departed(&mut self) {
        self.departed = true;
        self.cancel_reconnect();
        self.mark_down();
    }

    /// Records received traffic.
    pub const fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the peer has been silent for longer than `threshold`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > threshold
    }

    /// Advances the backoff and returns the delay for the next retry.
    pub fn next_backoff(&mut self) -> Duration {
        self.backoff.advance()
    }

    /// Stores the retry timer. Any previous one is aborted.
    pub fn set_reconnect(&mut self, timer: AbortHandle) {
        if let Some(old) = self.pending_reconnect.replace(timer) {
            old.abort();
        }
    }

    /// Clears the retry marker without aborting (the timer fired).
    pub fn clear_reconnect(&mut self) {
        self.pending_reconnect = None;
    }

    /// Aborts and clears any outstanding retry.
    pub fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.pending_reconnect.take() {
            timer.abort();
        }
    }

    /// Sends an envelope over the link if it is usable.
    pub fn send(&self, envelope: Envelope) -> bool {
        match &self.channel {
            Some(channel) => match channel.send(envelope) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(peer = %self.peer_id, error = %e, "send dropped");
                    false
                }
            },
            None => false,
        }
    }
}

/// All peer records, keyed by peer id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    records: BTreeMap<PeerId, PeerRecord>,
    floor: Duration,
    cap: Duration,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose records back off between `floor`
    /// and `cap`.
    #[must_use]
    pub const fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            floor,
            cap,
        }
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    /// Looks up a record for modification.
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.records.get_mut(peer)
    }

    /// Returns the record for `peer`, creating it if needed.
    pub fn entry(&mut self, peer: &PeerId, now: Instant) -> &mut PeerRecord {
        let backoff = Backoff::new(self.floor, self.cap);
        self.records
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(peer.clone(), backoff, now))
    }

    /// Iterates every record in peer-id order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Iterates every record mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.records.values_mut()
    }

    /// Peers that are Connected over an open link.
    pub fn connected(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records
            .values()
            .filter(|r| r.status == PeerStatus::Connected && r.has_open_channel())
    }

    /// Sends to one peer. Returns `false` if the peer has no usable link.
    pub fn send_to(&self, peer: &PeerId, envelope: Envelope) -> bool {
        self.records
            .get(peer)
            .filter(|r| r.status == PeerStatus::Connected)
            .is_some_and(|r| r.send(envelope))
    }

    /// Sends to every Connected peer not listed in `except`.
    ///
    /// Returns how many peers the envelope was handed to.
    pub fn broadcast(&self, envelope: &Envelope, except: &[&PeerId]) -> usize {
        self.connected()
            .filter(|r| !except.contains(&r.peer_id()))
            .filter(|r| r.send(envelope.clone()))
            .count()
    }

    /// Status label of every known peer.
    #[must_use]
    pub fn status_labels(&self) -> BTreeMap<PeerId, PeerStatusLabel> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), r.status.into()))
            .collect()
    }

    /// Closes every link and cancels every retry.
    pub fn shutdown(&mut self) {
        for record in self.records.values_mut() {
            record.cancel_reconnect();
            record.mark_down();
        }
    }
}
