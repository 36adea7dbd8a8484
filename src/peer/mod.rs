//! Peer management module
//!
//! Per-peer protocol state machines and the piece sets they advertise.

pub mod bitfield;
pub mod connection;
pub mod state;

// Re-export main types
pub use bitfield::Bitfield;
pub use connection::{ConnectionLimits, PeerConnection, PeerSocket};
pub use state::{ConnectionState, PeerInfo, PeerSource, PeerStats};
