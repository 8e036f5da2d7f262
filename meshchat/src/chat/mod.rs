//! Chat state: the dedup ledger, the two logs, and history replay.
//!
//! [`ChatState`] decides what is new. Forwarding admitted messages to
//! other peers is the session's job; nothing in here touches a link.

pub mod history;
pub mod ledger;
pub mod log;

use meshchat_proto::message::{
    ChatMessage, ChatMode, FileOffer, HistoryBundle, MsgId, PeerId, Timestamp, ValidationError,
    ViewingSession,
};

use history::MergeOutcome;
use ledger::DedupLedger;
use log::ChatLogs;

use crate::mesh::roster::display_color;

/// Ledger plus logs for one session.
#[derive(Debug, Default)]
pub struct ChatState {
    ledger: DedupLedger,
    logs: ChatLogs,
}

impl ChatState {
    /// Creates empty chat state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a chat message. Returns `false` for a duplicate, which is
    /// dropped without touching the logs.
    pub fn admit_chat(&mut self, msg: &ChatMessage) -> bool {
        if !self.ledger.admit(&msg.msg_id) {
            return false;
        }
        self.logs.push_chat(msg.clone());
        true
    }

    /// Admits a file offer. Returns `false` if its ledger id was already
    /// seen or the file is already listed. A new id for a listed file is
    /// recorded in the ledger only.
    pub fn admit_file(&mut self, offer: &FileOffer) -> bool {
        let offer = offer.normalized();
        if !self.ledger.admit(&offer.ledger_id()) {
            return false;
        }
        self.logs.push_file(offer)
    }

    /// Builds the history replay for a new peer.
    #[must_use]
    pub fn bundle(&self, viewing: Option<&ViewingSession>) -> HistoryBundle {
        history::build_bundle(&self.logs, viewing)
    }

    /// Merges a history replay from the host.
    pub fn merge(&mut self, bundle: HistoryBundle) -> MergeOutcome {
        history::merge(bundle, &mut self.ledger, &mut self.logs)
    }

    /// Both logs.
    #[must_use]
    pub const fn logs(&self) -> &ChatLogs {
        &self.logs
    }

    /// Whether `id` has been seen.
    #[must_use]
    pub fn knows(&self, id: &MsgId) -> bool {
        self.ledger.contains(id)
    }

    /// Clears the co-viewing log when a viewing session ends.
    pub fn reset_co_viewing(&mut self) {
        self.logs.reset_co_viewing();
    }
}

/// Builds and validates a locally authored message with a fresh id.
///
/// # Errors
///
/// Returns [`ValidationError`] if the text is blank or over `max_size`.
pub fn compose(
    sender: &PeerId,
    username: &str,
    text: &str,
    mode: ChatMode,
    max_size: usize,
) -> Result<ChatMessage, ValidationError> {
    let timestamp = Timestamp::now();
    let msg = ChatMessage {
        msg_id: MsgId::generate(sender, timestamp, rand::random::<u32>()),
        sender_id: sender.clone(),
        text: text.trim().to_string(),
        username: username.to_string(),
        timestamp,
        display_color: display_color(username).to_string(),
        chat_mode: mode,
    };
    msg.validate(max_size)?;
    Ok(msg)
}
