//! Engine configuration
//!
//! Start-up settings handed from the driver to every torrent.

use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TorrentError};

/// Default block size requested from peers (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Largest block size peers are expected to honour
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-TE0100-";

/// Round a request size up to the next power of two.
///
/// Mirrors `1 << (32 - clz(n - 1))`: values that are already a power of two
/// are kept, zero and one both map to one.
pub fn round_request_size(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    let shift = 32 - (n - 1).leading_zeros();
    if shift >= 32 {
        return 1 << 31;
    }
    1 << shift
}

/// Generate a random peer id carrying the engine prefix
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
    debug!("Generated peer id: {}", hex::encode(peer_id));
    peer_id
}

/// Engine settings shared by all torrents of a session
#[derive(Debug, Clone)]
pub struct Config {
    /// First port tried for the listener, incremented per torrent
    pub start_port: u16,
    /// Active peer cap per torrent (0 = unbounded)
    pub max_peers: usize,
    /// Directory torrents are downloaded into
    pub download_dir: PathBuf,
    /// Keep serving after the download completes
    pub seed: bool,
    /// Block size requested from peers
    pub block_size: u32,
    /// In-flight requests per peer
    pub pipeline_depth: usize,
    /// Peers unchoked at once
    pub max_uploads: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence after which a keep-alive is sent
    pub keep_alive_interval: Duration,
    /// Silence after which a peer is dropped
    pub peer_timeout: Duration,
    pub announce_timeout: Duration,
    pub tracker_backoff_min: Duration,
    pub tracker_backoff_max: Duration,
    /// Consecutive failures before a tracker is given up
    pub tracker_max_failures: u32,
    /// Re-announce interval when the tracker does not send one
    pub default_announce_interval: Duration,
    /// Upper bound of the multiplexer wait
    pub poll_timeout: Duration,
    pub peer_id: [u8; 20],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_port: 6881,
            max_peers: 30,
            download_dir: PathBuf::from("Torrents"),
            seed: true,
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: 5,
            max_uploads: 4,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(180),
            announce_timeout: Duration::from_secs(30),
            tracker_backoff_min: Duration::from_secs(15),
            tracker_backoff_max: Duration::from_secs(30 * 60),
            tracker_max_failures: 5,
            default_announce_interval: Duration::from_secs(30 * 60),
            poll_timeout: Duration::from_millis(5),
            peer_id: generate_peer_id(),
        }
    }
}

impl Config {
    /// Set the block size, rounded up to a power of two
    pub fn with_block_size(mut self, size: u32) -> Self {
        self.block_size = round_request_size(size);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(TorrentError::config_error_with_field("Block size cannot be 0", "block_size"));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(TorrentError::config_error_with_field(
                format!("Block size {} exceeds {}", self.block_size, MAX_BLOCK_SIZE),
                "block_size",
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err(TorrentError::config_error_with_field("Block size must be a power of two", "block_size"));
        }
        if self.pipeline_depth == 0 {
            return Err(TorrentError::config_error_with_field("Pipeline depth must be at least 1", "pipeline_depth"));
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("Download directory cannot be empty", "download_dir"));
        }
        if self.tracker_backoff_min > self.tracker_backoff_max {
            return Err(TorrentError::config_error_with_field(
                "Minimum tracker backoff exceeds maximum",
                "tracker_backoff_min",
            ));
        }
        Ok(())
    }

    /// Whether another peer may be added given the current count
    pub fn allows_more_peers(&self, active: usize) -> bool {
        self.max_peers == 0 || active < self.max_peers
    }
}
