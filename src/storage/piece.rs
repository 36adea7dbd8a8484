//! Piece state module
//!
//! Per-piece download bookkeeping: held blocks, in-flight requests and status.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use sha1::{Digest, Sha1};

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    /// Nothing held or requested
    #[default]
    Missing,
    /// Some blocks held or requested
    InProgress,
    /// All blocks held and the digest matched
    Verified,
}

/// Download state of one piece
#[derive(Debug, Clone)]
pub struct PieceState {
    pub index: u32,
    pub status: PieceStatus,
    /// Piece size in bytes
    length: u32,
    block_size: u32,
    /// Block buffers, `None` while missing
    blocks: Vec<Option<Vec<u8>>>,
    /// In-flight block indices per peer
    pending: HashMap<SocketAddr, HashSet<usize>>,
}

impl PieceState {
    /// Create a missing piece of `length` bytes split into `block_size` blocks
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let num_blocks = (length as usize).div_ceil(block_size as usize);
        Self {
            index,
            status: PieceStatus::Missing,
            length,
            block_size,
            blocks: vec![None; num_blocks],
            pending: HashMap::new(),
        }
    }

    /// Piece size in bytes
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Number of blocks in the piece
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Offset and length of block `block`
    pub fn block_bounds(&self, block: usize) -> (u32, u32) {
        let begin = block as u32 * self.block_size;
        let length = std::cmp::min(self.block_size, self.length - begin);
        (begin, length)
    }

    /// Block index for a byte offset, if it lands on a block boundary
    pub fn block_at(&self, begin: u32) -> Option<usize> {
        if begin % self.block_size != 0 {
            return None;
        }
        let block = (begin / self.block_size) as usize;
        (block < self.blocks.len()).then_some(block)
    }

    pub fn has_block(&self, block: usize) -> bool {
        self.blocks.get(block).is_some_and(|b| b.is_some())
    }

    /// Number of blocks held
    pub fn blocks_held(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Whether a block is requested from any peer
    pub fn is_pending(&self, block: usize) -> bool {
        self.pending.values().any(|set| set.contains(&block))
    }

    /// Lowest block that is neither held nor in flight
    pub fn next_unrequested(&self) -> Option<usize> {
        (0..self.blocks.len()).find(|&b| !self.has_block(b) && !self.is_pending(b))
    }

    /// Record a request to `peer`
    pub fn add_pending(&mut self, peer: SocketAddr, block: usize) {
        self.pending.entry(peer).or_default().insert(block);
        if self.status == PieceStatus::Missing {
            self.status = PieceStatus::InProgress;
        }
    }

    /// Forget a request to `peer`; returns whether it was in flight
    pub fn remove_pending(&mut self, peer: &SocketAddr, block: usize) -> bool {
        let removed = match self.pending.get_mut(peer) {
            Some(set) => {
                let removed = set.remove(&block);
                if set.is_empty() {
                    self.pending.remove(peer);
                }
                removed
            }
            None => false,
        };
        self.settle_status();
        removed
    }

    /// Forget every request to `peer`; returns the released block indices
    pub fn release_peer(&mut self, peer: &SocketAddr) -> Vec<usize> {
        let released: Vec<usize> = self
            .pending
            .remove(peer)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        self.settle_status();
        released
    }

    /// In-flight blocks for `peer`
    pub fn pending_for(&self, peer: &SocketAddr) -> usize {
        self.pending.get(peer).map_or(0, |set| set.len())
    }

    /// Store a block; returns `false` if it was already held
    pub fn insert_block(&mut self, block: usize, data: Vec<u8>) -> bool {
        if self.has_block(block) {
            return false;
        }
        self.blocks[block] = Some(data);
        if self.status == PieceStatus::Missing {
            self.status = PieceStatus::InProgress;
        }
        true
    }

    /// Whether every block is held
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.is_some())
    }

    /// Concatenate held blocks and compare against `expected`
    pub fn verify(&self, expected: &[u8; 20]) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(self.length as usize);
        for block in &self.blocks {
            data.extend_from_slice(block.as_ref()?);
        }
        let digest: [u8; 20] = Sha1::digest(&data).into();
        (digest == *expected).then_some(data)
    }

    /// Drop all buffered data and requests; returns the number of bytes discarded
    pub fn reset(&mut self) -> u64 {
        let discarded = self.blocks.iter().flatten().map(|b| b.len() as u64).sum();
        for block in &mut self.blocks {
            *block = None;
        }
        self.pending.clear();
        self.status = PieceStatus::Missing;
        discarded
    }

    /// Mark verified and free the buffers
    pub fn mark_verified(&mut self) {
        for block in &mut self.blocks {
            *block = None;
        }
        self.pending.clear();
        self.status = PieceStatus::Verified;
    }

    fn settle_status(&mut self) {
        if self.status == PieceStatus::InProgress && self.pending.is_empty() && self.blocks_held() == 0 {
            self.status = PieceStatus::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_block_layout_short_last_block() {
        let piece = PieceState::new(0, 40_000, 16_384);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.block_bounds(0), (0, 16_384));
        assert_eq!(piece.block_bounds(2), (32_768, 40_000 - 32_768));
        assert_eq!(piece.block_at(16_384), Some(1));
        assert_eq!(piece.block_at(100), None);
        assert_eq!(piece.block_at(49_152), None);
    }

    #[test]
    fn test_pending_and_release() {
        let mut piece = PieceState::new(0, 32_768, 16_384);
        piece.add_pending(peer(1), 0);
        piece.add_pending(peer(1), 1);
        assert_eq!(piece.status, PieceStatus::InProgress);
        assert_eq!(piece.next_unrequested(), None);

        let mut released = piece.release_peer(&peer(1));
        released.sort();
        assert_eq!(released, vec![0, 1]);
        assert_eq!(piece.status, PieceStatus::Missing);
        assert_eq!(piece.next_unrequested(), Some(0));
    }

    #[test]
    fn test_verify_and_reset() {
        let mut piece = PieceState::new(0, 8, 4);
        piece.insert_block(0, b"abcd".to_vec());
        assert!(!piece.insert_block(0, b"zzzz".to_vec()));
        piece.insert_block(1, b"efgh".to_vec());
        assert!(piece.is_complete());

        let good: [u8; 20] = Sha1::digest(b"abcdefgh").into();
        assert_eq!(piece.verify(&good).unwrap(), b"abcdefgh");
        assert!(piece.verify(&[0u8; 20]).is_none());

        assert_eq!(piece.reset(), 8);
        assert_eq!(piece.status, PieceStatus::Missing);
        assert_eq!(piece.blocks_held(), 0);
    }
}
