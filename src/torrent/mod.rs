//! Torrent module
//!
//! Descriptor parsing, the per-torrent swarm state machine and its statistics.

pub mod meta;
pub mod stats;
pub mod torrent;

pub use meta::{create_descriptor, FileEntry, TorrentMeta};
pub use stats::TorrentStats;
pub use torrent::{DownloadState, Torrent};
