//! Piece bitfield
//!
//! MSB-first set of piece indices, as carried by the `bitfield` message.

use crate::error::{Result, TorrentError};

/// Set of piece indices backed by the wire representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Create an empty bitfield for `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Build from a received `bitfield` payload.
    ///
    /// The payload must be exactly `ceil(num_pieces / 8)` bytes and the spare
    /// trailing bits must be clear.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self> {
        let expected = num_pieces.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_violation_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            ));
        }
        let spare = expected * 8 - num_pieces;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_violation("Bitfield has spare bits set"));
            }
        }
        Ok(Self {
            bits: bytes.to_vec(),
            num_pieces,
        })
    }

    /// Whether piece `index` is in the set
    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] & (1 << (7 - (index % 8))) != 0
    }

    /// Add piece `index`; returns `false` when it was already present or out of range
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.num_pieces || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - (index % 8));
        true
    }

    /// Remove piece `index`
    pub fn clear(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] &= !(1 << (7 - (index % 8)));
        }
    }

    /// Number of pieces in the set
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether every piece is present
    pub fn is_full(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of pieces the bitfield describes
    pub fn len(&self) -> usize {
        self.num_pieces
    }

    /// Iterate the indices in the set, ascending
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |&i| self.has(i))
    }

    /// Wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
