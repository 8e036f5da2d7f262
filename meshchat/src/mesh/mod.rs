//! Mesh connection management.
//!
//! - [`registry`]: per-peer link records and reconnect timers
//! - [`backoff`]: exponential retry delays
//! - [`keepalive`]: ping sweep and stale-link detection
//! - [`roster`]: display names and colours
//! - [`lifecycle`]: what the session does when links open, close or go quiet

pub mod backoff;
pub mod keepalive;
pub mod lifecycle;
pub mod registry;
pub mod roster;
