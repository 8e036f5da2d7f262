//! Message deduplication ledger.

use std::collections::HashSet;

use meshchat_proto::message::MsgId;

/// Every message id this process has accepted.
///
/// Ids are kept for the life of the session: a message that comes back
/// around the mesh hours later must still be recognised.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: HashSet<MsgId>,
}

impl DedupLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id`. Returns `true` the first time, `false` for a duplicate.
    pub fn admit(&mut self, id: &MsgId) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.clone())
    }

    /// Whether `id` was already admitted.
    #[must_use]
    pub fn contains(&self, id: &MsgId) -> bool {
        self.seen.contains(id)
    }

    /// Number of distinct ids seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing has been admitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
