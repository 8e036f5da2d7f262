//! Display names and colours.
//!
//! The host hands out `Peer N` names in connection order and is itself
//! called `Host`. Guests mirror whatever roster the host last broadcast.

use std::collections::{BTreeMap, HashMap};

use meshchat_proto::message::{PeerId, PeerStatusLabel};

/// Name the host gives itself.
pub const HOST_NAME: &str = "Host";

/// Palette usernames are hashed into.
pub const USER_COLORS: [&str; 9] = [
    "#1859bb", "#267c26", "#a12c3a", "#8c2cb1", "#b17a2c", "#308898", "#cb482a", "#1f7272",
    "#b12c8c",
];

/// Colour used when there is no name to hash.
pub const FALLBACK_COLOR: &str = "#888";

/// Picks a stable colour for a display name.
///
/// 31-multiplier hash over UTF-16 code units with 32-bit wraparound.
#[must_use]
pub fn display_color(name: &str) -> &'static str {
    if name.is_empty() {
        return FALLBACK_COLOR;
    }
    let hash = name.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    });
    let index = usize::try_from(hash.unsigned_abs()).unwrap_or(0) % USER_COLORS.len();
    USER_COLORS[index]
}

/// Trims and truncates a proposed display name.
///
/// Returns `None` when nothing printable remains.
#[must_use]
pub fn sanitize_name(raw: &str, max_chars: usize) -> Option<String> {
    let name: String = raw.trim().chars().take(max_chars).collect();
    let name = name.trim_end().to_string();
    (!name.is_empty()).then_some(name)
}

/// Who is called what, plus the host's view of everyone's status.
#[derive(Debug, Default)]
pub struct Roster {
    names: BTreeMap<PeerId, String>,
    assigned: HashMap<PeerId, String>,
    assigned_count: u32,
    status_overrides: Option<BTreeMap<PeerId, PeerStatusLabel>>,
}

impl Roster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default name for `peer`, allocating the next
    /// `Peer N` the first time a peer is seen.
    pub fn assign_default(&mut self, peer: &PeerId) -> String {
        if let Some(name) = self.assigned.get(peer) {
            return name.clone();
        }
        self.assigned_count += 1;
        let name = format!("Peer {}", self.assigned_count);
        self.assigned.insert(peer.clone(), name.clone());
        name
    }

    /// Records `name` for `peer` (already sanitized).
    pub fn set_name(&mut self, peer: &PeerId, name: String) {
        self.assigned.insert(peer.clone(), name.clone());
        self.names.insert(peer.clone(), name);
    }

    /// Name of `peer`, if one is known.
    #[must_use]
    pub fn name_of(&self, peer: &PeerId) -> Option<&str> {
        self.names.get(peer).map(String::as_str)
    }

    /// Name of `peer`, or its id when no name is known.
    #[must_use]
    pub fn display_name(&self, peer: &PeerId) -> String {
        self.name_of(peer)
            .map_or_else(|| peer.to_string(), str::to_string)
    }

    /// Every known name.
    #[must_use]
    pub const fn names(&self) -> &BTreeMap<PeerId, String> {
        &self.names
    }

    /// Replaces the whole roster with the host's snapshot.
    pub fn replace(
        &mut self,
        users: BTreeMap<PeerId, String>,
        statuses: BTreeMap<PeerId, PeerStatusLabel>,
    ) {
        self.names = users;
        self.status_overrides = Some(statuses);
    }

    /// Takes the host's statuses without touching names.
    pub fn set_statuses(&mut self, statuses: BTreeMap<PeerId, PeerStatusLabel>) {
        self.status_overrides = Some(statuses);
    }

    /// Status the host reported for `peer`, if a snapshot was received.
    #[must_use]
    pub fn status_override(&self, peer: &PeerId) -> Option<PeerStatusLabel> {
        self.status_overrides
            .as_ref()
            .and_then(|m| m.get(peer).copied())
    }

    /// Adjusts the host-reported status of `peer`, if a snapshot exists.
    pub fn override_status(&mut self, peer: &PeerId, status: PeerStatusLabel) {
        if let Some(overrides) = self.status_overrides.as_mut() {
            overrides.insert(peer.clone(), status);
        }
    }

    /// Forgets the host-reported statuses.
    pub fn clear_overrides(&mut self) {
        self.status_overrides = None;
    }
}
