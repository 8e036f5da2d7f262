//! `meshchat`: a host-centred peer mesh for group chat and file transfer.

pub mod chat;
pub mod config;
pub mod mesh;
pub mod session;
pub mod transfer;
pub mod transport;
