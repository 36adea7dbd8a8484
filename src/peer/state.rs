//! Peer state module
//!
//! Connection states and per-peer bookkeeping shared with the torrent.

use std::net::SocketAddr;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Waiting for the remote handshake
    Handshaking,
    /// Handshake validated, messages flowing
    Established,
    /// Terminal; the socket is about to be dropped
    Closing,
}

impl ConnectionState {
    /// Check if the peer is established
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing)
    }
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// Returned by a tracker announce
    Tracker,
    /// Connected to our listener
    Incoming,
}

/// Information about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub source: PeerSource,
}

impl PeerInfo {
    /// Create a new peer info
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            peer_id: None,
            source,
        }
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

/// Transfer counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Block payload received
    pub downloaded: u64,
    /// Block payload sent
    pub uploaded: u64,
    /// Raw bytes read from the socket
    pub bytes_read: u64,
    /// Raw bytes written to the socket
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_predicates() {
        assert_eq!(ConnectionState::default(), ConnectionState::Connecting);
        assert!(ConnectionState::Established.is_established());
        assert!(!ConnectionState::Handshaking.is_established());
        assert!(ConnectionState::Closing.is_closing());
    }

    #[test]
    fn test_peer_info() {
        let mut info = PeerInfo::new("127.0.0.1:6881".parse().unwrap(), PeerSource::Tracker);
        assert!(info.peer_id_hex().is_none());
        info.peer_id = Some([0xab; 20]);
        assert_eq!(info.peer_id_hex().unwrap(), "ab".repeat(20));
    }
}
