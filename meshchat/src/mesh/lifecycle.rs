//! What happens when mesh links open, close, or go quiet.
//!
//! A peer's record moves Connecting → Connected when its link opens and
//! back to Disconnected when it closes, errors, or misses keep-alives.
//! Every loss schedules one reconnect with exponential backoff unless the
//! peer said goodbye. A guest never redials its host: losing the host ends
//! the session until the host dials back.

use tokio::time::Instant;

use meshchat_proto::link::LinkPurpose;
use meshchat_proto::message::{AssignName, Envelope, PeerId, PeerStatusLabel, UsernameUpdate};

use super::keepalive::{self, KeepAliveAction};
use crate::config::Role;
use crate::session::{MeshSession, SessionNotice};
use crate::transport::{LinkHandle, LinkId};

/// Steps run, in order, each time a mesh link opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostConnectHook {
    /// Probe the peer so both sides start their silence clocks.
    KeepAlive,
    /// Host: name the peer and share the roster. Guest: announce our name.
    Identity,
    /// Host: replay both chat logs.
    HistorySync,
    /// Host: share the active viewing session.
    ViewingAnnounce,
}

impl PostConnectHook {
    /// Hooks for a role.
    #[must_use]
    pub fn for_role(role: &Role) -> Vec<Self> {
        if role.is_host() {
            vec![
                Self::KeepAlive,
                Self::Identity,
                Self::HistorySync,
                Self::ViewingAnnounce,
            ]
        } else {
            vec![Self::KeepAlive, Self::Identity]
        }
    }
}

impl MeshSession {
    /// Opens a mesh link to `peer` unless one is already usable.
    pub(crate) fn connect_to(&mut self, peer: &PeerId) {
        if *peer == self.local_id {
            return;
        }
        let now = Instant::now();
        if self
            .registry
            .entry(peer, now)
            .has_open_channel()
        {
            tracing::trace!(peer = %peer, "link already open");
            return;
        }

        match self
            .connector
            .connect(peer, LinkPurpose::Mesh, self.link_tx.clone())
        {
            Ok(handle) => {
                tracing::info!(peer = %peer, link = %handle.id(), "dialing");
                self.registry.entry(peer, now).attach(handle, now);
                self.notify_peers();
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "cannot dial");
                self.link_down(peer, &e.to_string());
            }
        }
    }

    /// A peer dialed us.
    pub(crate) fn on_incoming(&mut self, handle: LinkHandle) {
        let peer = handle.peer().clone();
        let now = Instant::now();
        if self.session_ended && self.is_upstream(&peer) {
            tracing::info!(peer = %peer, "host is back, resuming session");
            self.session_ended = false;
        }
        tracing::info!(peer = %peer, link = %handle.id(), "accepted link");
        self.registry.entry(&peer, now).attach(handle, now);
        self.link_up(&peer);
    }

    /// One of our dials finished opening.
    pub(crate) fn on_opened(&mut self, link: LinkId, peer: &PeerId) {
        if self.registry.get(peer).is_some_and(|r| r.owns(link)) {
            self.link_up(peer);
        } else {
            tracing::debug!(peer = %peer, %link, "superseded link opened");
        }
    }

    /// A mesh link closed or failed.
    pub(crate) fn on_closed(&mut self, link: LinkId, peer: &PeerId, reason: &str) {
        if self.registry.get(peer).is_some_and(|r| r.owns(link)) {
            self.link_down(peer, reason);
        } else {
            tracing::trace!(peer = %peer, %link, "superseded link closed");
        }
    }

    fn link_up(&mut self, peer: &PeerId) {
        let Some(record) = self.registry.get_mut(peer) else {
            return;
        };
        record.mark_open(Instant::now());
        tracing::info!(peer = %peer, "link open");
        if self.is_upstream(peer) {
            self.session_ended = false;
        }
        for hook in self.hooks.clone() {
            self.run_hook(hook, peer);
        }
        self.notify_peers();
    }

    fn run_hook(&mut self, hook: PostConnectHook, peer: &PeerId) {
        match hook {
            PostConnectHook::KeepAlive => {
                self.registry.send_to(peer, Envelope::Ping);
            }
            PostConnectHook::Identity if self.role.is_host() => {
                let name = match self.roster.name_of(peer) {
                    Some(name) => name.to_string(),
                    None => self.roster.assign_default(peer),
                };
                self.roster.set_name(peer, name.clone());
                self.registry.send_to(
                    peer,
                    Envelope::AssignName(AssignName {
                        username: name,
                        peer_id: peer.clone(),
                        all_statuses: self.status_snapshot(),
                    }),
                );
                self.broadcast_user_list();
            }
            PostConnectHook::Identity => {
                if self.chosen_name {
                    self.registry.send_to(
                        peer,
                        Envelope::Username(UsernameUpdate {
                            username: self.username.clone(),
                            peer_id: Some(self.local_id.clone()),
                            req_user_list: true,
                        }),
                    );
                }
            }
            PostConnectHook::HistorySync => {
                if self.role.is_host() {
                    let bundle = self.chat.bundle(self.viewing.as_ref());
                    tracing::debug!(
                        peer = %peer,
                        normal = bundle.normal.len(),
                        co_viewing = bundle.co_viewing.len(),
                        "sending history"
                    );
                    self.registry.send_to(peer, Envelope::History(bundle));
                }
            }
            PostConnectHook::ViewingAnnounce => {
                if let Some(viewing) = self.viewing.as_ref().filter(|v| v.active)
                    && self.role.is_host()
                {
                    self.registry
                        .send_to(peer, Envelope::SessionInfo(viewing.clone()));
                }
            }
        }
    }

    /// Marks `peer` Disconnected and decides what happens next.
    pub(crate) fn link_down(&mut self, peer: &PeerId, reason: &str) {
        let Some(record) = self.registry.get_mut(peer) else {
            return;
        };
        record.mark_down();
        let departed = record.departed();
        tracing::warn!(peer = %peer, reason, "link down");

        self.roster
            .override_status(peer, PeerStatusLabel::Disconnected);

        if self.is_upstream(peer) {
            self.end_session();
            return;
        }
        self.broadcast_user_list();
        self.notify_peers();
        if !departed {
            self.schedule_reconnect(peer);
        }
    }

    fn schedule_reconnect(&mut self, peer: &PeerId) {
        let Some(record) = self.registry.get_mut(peer) else {
            return;
        };
        if record.has_pending_reconnect() || record.departed() {
            return;
        }
        let delay = record.next_backoff();
        let timers = self.timer_tx.clone();
        let target = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(target);
        });
        record.set_reconnect(timer.abort_handle());
        tracing::info!(
            peer = %peer,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
    }

    /// A reconnect timer fired.
    pub(crate) fn on_reconnect_due(&mut self, peer: &PeerId) {
        let Some(record) = self.registry.get_mut(peer) else {
            return;
        };
        record.clear_reconnect();
        if record.departed() || record.has_open_channel() {
            return;
        }
        if self.is_upstream(peer) && self.session_ended {
            return;
        }
        tracing::debug!(peer = %peer, "retrying");
        self.connect_to(peer);
    }

    /// Pings healthy peers and drops silent ones.
    pub(crate) fn keepalive_tick(&mut self) {
        let actions = keepalive::sweep(&self.registry, Instant::now(), self.mesh.stale_after);
        for action in actions {
            match action {
                KeepAliveAction::Probe(peer) => {
                    self.registry.send_to(&peer, Envelope::Ping);
                }
                KeepAliveAction::Expire(peer) => {
                    self.link_down(&peer, "keep-alive timeout");
                }
            }
        }
    }

    /// The guest's host is gone.
    pub(crate) fn end_session(&mut self) {
        if self.session_ended {
            return;
        }
        self.session_ended = true;
        self.roster.clear_overrides();
        tracing::warn!("session ended, host disconnected");
        self.notify(SessionNotice::SessionEnded);
        self.notify_peers();
    }
}
