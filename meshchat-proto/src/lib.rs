//! Shared protocol definitions for the meshchat wire format.

pub mod codec;
pub mod link;
pub mod message;
