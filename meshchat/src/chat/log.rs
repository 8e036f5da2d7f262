//! The two append-only chat logs.

use meshchat_proto::message::{ChatMessage, ChatMode, FileMsgId, FileOffer, LogEntry};

/// Normal and co-viewing logs, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct ChatLogs {
    normal: Vec<LogEntry>,
    co_viewing: Vec<ChatMessage>,
}

impl ChatLogs {
    /// Creates empty logs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chat message to the log its mode selects.
    pub fn push_chat(&mut self, msg: ChatMessage) {
        match msg.chat_mode {
            ChatMode::Normal => self.push_normal(msg),
            ChatMode::CoViewing => self.push_co_viewing(msg),
        }
    }

    /// Appends a chat message to the normal log.
    pub fn push_normal(&mut self, msg: ChatMessage) {
        self.normal.push(LogEntry::Chat(msg));
    }

    /// Appends a chat message to the co-viewing log.
    pub fn push_co_viewing(&mut self, msg: ChatMessage) {
        self.co_viewing.push(msg);
    }

    /// Appends a file offer to the normal log unless one with the same
    /// file id is already there. Returns whether it was appended.
    pub fn push_file(&mut self, offer: FileOffer) -> bool {
        if self.find_file(&offer.file_msg_id).is_some() {
            return false;
        }
        self.normal.push(LogEntry::File(offer));
        true
    }

    /// Looks up a file offer in the normal log.
    #[must_use]
    pub fn find_file(&self, id: &FileMsgId) -> Option<&FileOffer> {
        self.normal.iter().find_map(|entry| match entry {
            LogEntry::File(offer) if &offer.file_msg_id == id => Some(offer),
            _ => None,
        })
    }

    /// Every file offer in the normal log.
    pub fn files(&self) -> impl Iterator<Item = &FileOffer> {
        self.normal.iter().filter_map(|entry| match entry {
            LogEntry::File(offer) => Some(offer),
            LogEntry::Chat(_) => None,
        })
    }

    /// The normal log.
    #[must_use]
    pub fn normal(&self) -> &[LogEntry] {
        &self.normal
    }

    /// The co-viewing log.
    #[must_use]
    pub fn co_viewing(&self) -> &[ChatMessage] {
        &self.co_viewing
    }

    /// Drops the whole co-viewing log.
    pub fn reset_co_viewing(&mut self) {
        self.co_viewing.clear();
    }
}
