//! BitTorrent handshake protocol
//!
//! The fixed 68-byte greeting exchanged before any other message.

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{Result, TorrentError};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of a serialized handshake
pub const HANDSHAKE_LEN: usize = 68;

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bits, always sent as zero
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly [`HANDSHAKE_LEN`] bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_violation_with_source(
                "Handshake has wrong size",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ));
        }

        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_violation_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            ));
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol_violation("Invalid protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!("Handshake from peer id {}", hex::encode(peer_id));
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the handshake belongs to the expected torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[test]
    fn test_bad_protocol_string_rejected() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'x';
        let err = Handshake::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_short_handshake_rejected() {
        assert!(Handshake::deserialize(&[19u8; 40]).is_err());
    }
}
