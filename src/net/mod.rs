//! Network module
//!
//! Socket readiness shared by every torrent of a session.

pub mod multiplexer;

pub use multiplexer::{Endpoint, Multiplexer, Owner, Readiness, TorrentId};
