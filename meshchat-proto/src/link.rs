//! Link-level handshake records.
//!
//! Stream transports send a [`LinkHello`] as the first frame of every
//! connection so the accepting side learns who is calling and why.

use serde::{Deserialize, Serialize};

use crate::message::{FileMsgId, PeerId};

/// What a link is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkPurpose {
    /// The long-lived chat and control link between two peers.
    Mesh,
    /// A dedicated link carrying one file transfer.
    Transfer {
        /// File being transferred.
        file_msg_id: FileMsgId,
    },
}

impl LinkPurpose {
    /// Returns `true` for dedicated transfer links.
    #[must_use]
    pub const fn is_transfer(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }
}

/// First frame on a stream link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHello {
    /// Identity of the dialing peer.
    pub peer_id: PeerId,
    /// Why the link was opened.
    pub purpose: LinkPurpose,
}
