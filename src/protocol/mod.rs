//! BitTorrent protocol module
//!
//! Implements the peer-wire protocol encoding.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{read_frame, write_frame, FrameDecoder, MAX_MESSAGE_LEN};
