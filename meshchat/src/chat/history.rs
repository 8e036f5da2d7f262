//! History replay for newly joined peers.
//!
//! The host sends a [`HistoryBundle`] once per new connection. Receivers
//! merge it through their dedup ledger, so replaying the same bundle, or
//! one overlapping what they already have, adds nothing twice.

use meshchat_proto::message::{FileOffer, HistoryBundle, LogEntry, ViewingSession};

use super::ledger::DedupLedger;
use super::log::ChatLogs;

/// Builds the bundle the host sends to a new peer.
///
/// File entries are normalized so each carries an explicit ledger id.
#[must_use]
pub fn build_bundle(logs: &ChatLogs, viewing: Option<&ViewingSession>) -> HistoryBundle {
    let normal = logs
        .normal()
        .iter()
        .map(|entry| match entry {
            LogEntry::File(offer) => LogEntry::File(offer.normalized()),
            LogEntry::Chat(_) => entry.clone(),
        })
        .collect();
    HistoryBundle {
        normal,
        co_viewing: logs.co_viewing().to_vec(),
        viewing: viewing.filter(|v| v.active).cloned(),
    }
}

/// What a merge changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries appended to the normal log (chats and files).
    pub normal_added: usize,
    /// Messages appended to the co-viewing log.
    pub co_viewing_added: usize,
    /// File offers that were new to this peer.
    pub new_files: Vec<FileOffer>,
    /// Viewing session to adopt, when the bundle carried an active one.
    pub viewing: Option<ViewingSession>,
}

impl MergeOutcome {
    /// Whether the merge appended anything.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.normal_added == 0 && self.co_viewing_added == 0
    }
}

/// Merges `bundle` into `logs`, admitting ids through `ledger`.
pub fn merge(bundle: HistoryBundle, ledger: &mut DedupLedger, logs: &mut ChatLogs) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for entry in bundle.normal {
        if !ledger.admit(&entry.ledger_id()) {
            continue;
        }
        match entry {
            LogEntry::File(offer) => {
                let offer = offer.normalized();
                if logs.push_file(offer.clone()) {
                    outcome.normal_added += 1;
                    outcome.new_files.push(offer);
                }
            }
            LogEntry::Chat(msg) => {
                logs.push_normal(msg);
                outcome.normal_added += 1;
            }
        }
    }

    for msg in bundle.co_viewing {
        if ledger.admit(&msg.msg_id) {
            logs.push_co_viewing(msg);
            outcome.co_viewing_added += 1;
        }
    }

    outcome.viewing = bundle.viewing.filter(|v| v.active);
    outcome
}
