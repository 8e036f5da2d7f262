//! Handling of link events and mesh traffic.

use tokio::time::Instant;

use meshchat_proto::message::{
    AssignName, ChatMessage, Envelope, FileOffer, HistoryBundle, PeerId, PeerStatusLabel,
    UserList, UsernameUpdate, ViewingSession,
};

use super::{MeshSession, SessionNotice};
use crate::mesh::roster::sanitize_name;
use crate::transport::{LinkEvent, LinkNotice};

impl MeshSession {
    pub(super) fn on_link(&mut self, notice: LinkNotice) {
        let LinkNotice {
            link,
            peer,
            purpose,
            event,
        } = notice;
        match event {
            LinkEvent::Incoming(handle) => {
                if purpose.is_transfer() {
                    self.accept_transfer_link(handle);
                } else {
                    self.on_incoming(handle);
                }
            }
            LinkEvent::Opened => {
                if purpose.is_transfer() {
                    self.transfer_link_opened(link);
                } else {
                    self.on_opened(link, &peer);
                }
            }
            LinkEvent::Data(envelope) => {
                let on_mesh_link = self.registry.get(&peer).is_some_and(|r| r.owns(link));
                if on_mesh_link && let Some(record) = self.registry.get_mut(&peer) {
                    record.touch(Instant::now());
                }
                if envelope.transfer_file_id().is_some() {
                    self.route_transfer(link, &peer, envelope);
                } else if on_mesh_link {
                    self.on_data(&peer, envelope);
                } else {
                    tracing::debug!(
                        peer = %peer,
                        %link,
                        kind = envelope.type_name(),
                        "frame on a link that is not the peer's mesh link"
                    );
                }
            }
            LinkEvent::Closed => {
                self.transfer_link_closed(link);
                if !purpose.is_transfer() {
                    self.on_closed(link, &peer, "closed by peer");
                }
            }
            LinkEvent::Error(reason) => {
                self.transfer_link_closed(link);
                if !purpose.is_transfer() {
                    self.on_closed(link, &peer, &reason);
                }
            }
        }
    }

    fn on_data(&mut self, from: &PeerId, envelope: Envelope) {
        tracing::trace!(peer = %from, kind = envelope.type_name(), "received");
        match envelope {
            Envelope::Ping => {
                self.registry.send_to(from, Envelope::Pong);
            }
            Envelope::Pong => {}
            Envelope::AssignName(assign) => self.on_assign_name(from, assign),
            Envelope::Username(update) => self.on_username(from, update),
            Envelope::UserList(list) => self.on_user_list(from, list),
            Envelope::Chat(msg) => self.on_chat(from, msg),
            Envelope::History(bundle) => self.on_history(from, bundle),
            Envelope::Goodbye { peer_id } => self.on_goodbye(from, &peer_id),
            Envelope::File(offer) => self.on_file_offer(from, offer),
            Envelope::SessionInfo(viewing) => self.on_session_info(from, viewing),
            Envelope::CoViewing(frame) => self.notify(SessionNotice::CoViewing {
                from: from.clone(),
                frame,
            }),
            other => {
                tracing::debug!(peer = %from, kind = other.type_name(), "unexpected on mesh link");
            }
        }
    }

    fn on_assign_name(&mut self, from: &PeerId, assign: AssignName) {
        if self.role.is_host() {
            tracing::debug!(peer = %from, "ignoring assignName sent to the host");
            return;
        }
        let Some(name) = sanitize_name(&assign.username, self.limits.max_username_len) else {
            return;
        };
        self.roster.set_name(&assign.peer_id, name.clone());
        if !assign.all_statuses.is_empty() {
            self.roster.set_statuses(assign.all_statuses);
        }
        if assign.peer_id == self.local_id && !self.chosen_name {
            tracing::info!(name = %name, "host assigned our name");
            self.username.clone_from(&name);
            self.notify(SessionNotice::UsernameChanged(name));
        }
        self.notify_peers();
    }

    fn on_username(&mut self, from: &PeerId, update: UsernameUpdate) {
        let Some(name) = sanitize_name(&update.username, self.limits.max_username_len) else {
            tracing::debug!(peer = %from, "ignoring empty username");
            return;
        };
        // The host only lets a peer rename itself.
        let subject = if self.role.is_host() {
            from.clone()
        } else {
            update.peer_id.unwrap_or_else(|| from.clone())
        };
        if subject == self.local_id {
            return;
        }
        tracing::debug!(peer = %subject, name = %name, "username update");
        self.roster.set_name(&subject, name);
        self.broadcast_user_list();
        self.notify_peers();
    }

    fn on_user_list(&mut self, from: &PeerId, list: UserList) {
        if self.role.is_host() {
            tracing::debug!(peer = %from, "ignoring userlist sent to the host");
            return;
        }
        self.roster.replace(list.users, list.statuses);
        self.notify_peers();
    }

    fn on_chat(&mut self, from: &PeerId, msg: ChatMessage) {
        if let Err(e) = msg.validate(self.limits.max_message_size) {
            tracing::debug!(peer = %from, error = %e, "dropping invalid chat");
            return;
        }
        if !self.chat.admit_chat(&msg) {
            tracing::trace!(msg_id = %msg.msg_id, "duplicate chat");
            return;
        }
        let origin = msg.sender_id.clone();
        let forwarded = self
            .registry
            .broadcast(&Envelope::Chat(msg.clone()), &[from, &origin]);
        tracing::debug!(msg_id = %msg.msg_id, forwarded, "chat admitted");
        self.notify(SessionNotice::ChatReceived(msg));
    }

    fn on_history(&mut self, from: &PeerId, bundle: HistoryBundle) {
        if self.role.is_host() {
            tracing::debug!(peer = %from, "ignoring history sent to the host");
            return;
        }
        let outcome = self.chat.merge(bundle);
        tracing::info!(
            normal = outcome.normal_added,
            co_viewing = outcome.co_viewing_added,
            "history merged"
        );
        if let Some(viewing) = outcome.viewing.clone()
            && self.viewing.as_ref() != Some(&viewing)
        {
            self.adopt_viewing(Some(viewing));
        }
        for offer in &outcome.new_files {
            self.notify(SessionNotice::FileOffered(offer.clone()));
        }
        self.notify(SessionNotice::HistoryMerged {
            normal_added: outcome.normal_added,
            co_viewing_added: outcome.co_viewing_added,
        });
    }

    fn on_goodbye(&mut self, from: &PeerId, peer_id: &PeerId) {
        if peer_id != from {
            tracing::debug!(peer = %from, claimed = %peer_id, "goodbye for another peer");
        }
        tracing::info!(peer = %from, "peer left");
        if let Some(record) = self.registry.get_mut(from) {
            record.mark_departed();
        }
        self.roster
            .override_status(from, PeerStatusLabel::Disconnected);
        if self.is_upstream(from) {
            self.end_session();
            return;
        }
        self.broadcast_user_list();
        self.notify_peers();
    }

    fn on_file_offer(&mut self, from: &PeerId, offer: FileOffer) {
        if !self.chat.admit_file(&offer) {
            return;
        }
        let offer = offer.normalized();
        tracing::info!(
            file = %offer.file_msg_id,
            name = %offer.file_name,
            size = offer.file_size,
            "file offered"
        );
        self.registry
            .broadcast(&Envelope::File(offer.clone()), &[from, &offer.sender_id]);
        self.notify(SessionNotice::FileOffered(offer));
    }

    fn on_session_info(&mut self, from: &PeerId, viewing: ViewingSession) {
        let next = viewing.active.then(|| viewing.clone());
        if next == self.viewing {
            return;
        }
        tracing::info!(
            session = %viewing.session_id,
            active = viewing.active,
            "viewing session update"
        );
        self.adopt_viewing(next);
        self.registry
            .broadcast(&Envelope::SessionInfo(viewing), &[from]);
    }
}
