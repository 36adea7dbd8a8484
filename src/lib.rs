//! torrent-engine
//!
//! A single-threaded BitTorrent client engine: many torrents, their peers and
//! their trackers all driven from one readiness poll loop.

pub mod cli;
pub mod config;
pub mod error;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{Result, TorrentError};

pub use config::Config;
pub use net::{Multiplexer, TorrentId};
pub use peer::{Bitfield, PeerConnection};
pub use protocol::{Handshake, Message};
pub use session::{Outcome, Session};
pub use storage::{FileStorage, MemoryStorage, PieceManager, StorageBackend};
pub use torrent::{create_descriptor, DownloadState, Torrent, TorrentMeta, TorrentStats};
pub use tracker::{AnnounceEvent, AnnounceResult, TrackerClient};
