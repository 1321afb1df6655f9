//! Peer wire protocol
pub mod codec;
pub mod message;
