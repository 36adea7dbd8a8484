//! Piece manager
//!
//! Chooses which blocks to request next, accepts incoming blocks, verifies
//! completed pieces and keeps the download counters.

use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TorrentError};
use crate::peer::bitfield::Bitfield;
use crate::storage::piece::{PieceState, PieceStatus};
use crate::storage::store::PieceStore;
use crate::torrent::meta::TorrentMeta;

/// A block chosen for request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub block: usize,
    pub begin: u32,
    pub length: u32,
}

/// Outcome of handing a received block to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// Block stored, piece not yet complete
    Accepted,
    /// Block completed the piece and the digest matched
    Verified(u32),
    /// Block completed the piece and the digest did not match; piece is missing again
    HashMismatch(u32),
    /// Block was already held; counted as wasted
    Duplicate,
}

/// Piece selection, verification and accounting for one torrent
#[derive(Debug)]
pub struct PieceManager {
    pieces: Vec<PieceState>,
    piece_hashes: Vec<[u8; 20]>,
    store: PieceStore,
    /// Number of connected peers advertising each piece
    availability: Vec<u32>,
    pipeline_depth: usize,
    total_size: u64,
    verified_bytes: u64,
    received_bytes: u64,
    wasted_bytes: u64,
    hash_misses: u64,
}

impl PieceManager {
    /// Create a manager for `meta`, with every piece missing
    pub fn new(meta: &TorrentMeta, store: PieceStore, block_size: u32, pipeline_depth: usize) -> Self {
        let pieces = (0..meta.piece_count() as u32)
            .map(|i| PieceState::new(i, meta.piece_size(i), block_size))
            .collect();
        debug!(
            "Piece manager for '{}': {} pieces, block size {}, pipeline depth {}",
            meta.name,
            meta.piece_count(),
            block_size,
            pipeline_depth
        );
        Self {
            pieces,
            piece_hashes: meta.piece_hashes.clone(),
            store,
            availability: vec![0; meta.piece_count()],
            pipeline_depth,
            total_size: meta.total_size,
            verified_bytes: 0,
            received_bytes: 0,
            wasted_bytes: 0,
            hash_misses: 0,
        }
    }

    /// Prepare the underlying store for writes
    pub fn initialize_store(&mut self) -> Result<()> {
        self.store.initialize()
    }

    /// Hash whatever content is already present and mark matching pieces verified.
    ///
    /// Unreadable pieces are treated as missing. Returns the number of pieces found.
    pub fn check_existing(&mut self) -> usize {
        if !self.store.has_existing_data() {
            return 0;
        }
        let mut found = 0;
        for index in 0..self.pieces.len() {
            if self.pieces[index].status == PieceStatus::Verified {
                continue;
            }
            let data = match self.store.read_piece(index as u32) {
                Ok(data) => data,
                Err(e) => {
                    trace!("Piece {} not readable during resume check: {}", index, e);
                    continue;
                }
            };
            let digest: [u8; 20] = Sha1::digest(&data).into();
            if digest == self.piece_hashes[index] {
                self.pieces[index].mark_verified();
                self.store.mark_held(index as u32);
                self.verified_bytes += data.len() as u64;
                found += 1;
            }
        }
        if found > 0 {
            info!("Found {} of {} pieces already on disk", found, self.pieces.len());
        }
        found
    }

    /// Blocks currently requested from `peer`
    pub fn in_flight(&self, peer: &SocketAddr) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.status == PieceStatus::InProgress)
            .map(|p| p.pending_for(peer))
            .sum()
    }

    /// Pick the next block to request from `peer`.
    ///
    /// Rarest piece first among those the peer has and we lack, lowest index on
    /// ties; lowest free block within the piece. Returns `None` when the peer's
    /// pipeline is full or it has nothing we need.
    pub fn select_next_request(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockRequest> {
        if self.in_flight(&peer) >= self.pipeline_depth {
            return None;
        }
        let (index, block) = self
            .pieces
            .iter()
            .filter(|p| p.status != PieceStatus::Verified && peer_bitfield.has(p.index as usize))
            .filter_map(|p| p.next_unrequested().map(|b| (p.index, b)))
            .min_by_key(|&(index, _)| (self.availability[index as usize], index))?;

        let piece = &mut self.pieces[index as usize];
        piece.add_pending(peer, block);
        let (begin, length) = piece.block_bounds(block);
        trace!("Selected block {}:{} ({}+{}) for {}", index, block, begin, length, peer);
        Some(BlockRequest {
            piece: index,
            block,
            begin,
            length,
        })
    }

    /// Accept a block received from `peer`.
    ///
    /// Malformed index, offset or size is a protocol violation; the data is never truncated.
    pub fn on_block_received(&mut self, peer: SocketAddr, index: u32, begin: u32, data: Vec<u8>) -> Result<VerifyResult> {
        let len = data.len() as u64;
        let piece = self.pieces.get_mut(index as usize).ok_or_else(|| {
            TorrentError::protocol_violation_with_source("Block for unknown piece", format!("piece {}", index))
        })?;
        let block = piece.block_at(begin).ok_or_else(|| {
            TorrentError::protocol_violation_with_source(
                "Block offset not on a block boundary",
                format!("piece {} begin {}", index, begin),
            )
        })?;
        let (_, expected) = piece.block_bounds(block);
        if data.len() != expected as usize {
            return Err(TorrentError::protocol_violation_with_source(
                "Block has wrong size",
                format!("piece {} begin {}: expected {}, got {}", index, begin, expected, data.len()),
            ));
        }

        if piece.status == PieceStatus::Verified {
            trace!("Duplicate block {}:{} for verified piece from {}", index, begin, peer);
            self.wasted_bytes += len;
            return Ok(VerifyResult::Duplicate);
        }
        piece.remove_pending(&peer, block);
        if !piece.insert_block(block, data) {
            trace!("Duplicate block {}:{} from {}", index, begin, peer);
            self.wasted_bytes += len;
            return Ok(VerifyResult::Duplicate);
        }
        self.received_bytes += len;

        if !piece.is_complete() {
            return Ok(VerifyResult::Accepted);
        }

        match piece.verify(&self.piece_hashes[index as usize]) {
            Some(content) => {
                self.store.write_piece(index, &content)?;
                piece.mark_verified();
                self.verified_bytes += content.len() as u64;
                debug!("Piece {} verified ({}/{})", index, self.completed_pieces(), self.total_pieces());
                Ok(VerifyResult::Verified(index))
            }
            None => {
                let discarded = piece.reset();
                self.wasted_bytes += discarded;
                self.hash_misses += 1;
                warn!("Piece {} failed hash check, discarded {} bytes", index, discarded);
                Ok(VerifyResult::HashMismatch(index))
            }
        }
    }

    /// Discard a piece's progress and make it selectable again
    pub fn mark_piece_missing(&mut self, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if piece.status == PieceStatus::Verified {
                self.verified_bytes -= piece.length() as u64;
                self.store.unmark_held(index);
            }
            self.wasted_bytes += piece.reset();
            debug!("Piece {} marked missing", index);
        }
    }

    /// Return one in-flight block of `peer` to the pool
    pub fn release(&mut self, peer: &SocketAddr, index: u32, block: usize) -> bool {
        match self.pieces.get_mut(index as usize) {
            Some(piece) => piece.remove_pending(peer, block),
            None => false,
        }
    }

    /// Return every in-flight block of `peer` to the pool; returns how many
    pub fn release_peer(&mut self, peer: &SocketAddr) -> usize {
        let released: usize = self
            .pieces
            .iter_mut()
            .filter(|p| p.status == PieceStatus::InProgress)
            .map(|p| p.release_peer(peer).len())
            .sum();
        if released > 0 {
            debug!("Released {} in-flight blocks of {}", released, peer);
        }
        released
    }

    /// A connected peer announced one piece
    pub fn peer_has_piece(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// A connected peer announced its full bitfield
    pub fn peer_has_bitfield(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter() {
            self.peer_has_piece(index as u32);
        }
    }

    /// A peer with `bitfield` disconnected
    pub fn peer_gone(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Whether `peer_bitfield` holds any piece we still need
    pub fn is_interesting(&self, peer_bitfield: &Bitfield) -> bool {
        self.pieces
            .iter()
            .any(|p| p.status != PieceStatus::Verified && peer_bitfield.has(p.index as usize))
    }

    /// Read a block of a verified piece for upload
    pub fn read_block(&mut self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        self.store.read_block(index, begin, length)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.status == PieceStatus::Verified)
    }

    pub fn piece_status(&self, index: u32) -> Option<PieceStatus> {
        self.pieces.get(index as usize).map(|p| p.status)
    }

    /// Verified pieces as a wire bitfield
    pub fn bitfield(&self) -> &Bitfield {
        self.store.bitfield()
    }

    pub fn completed_pieces(&self) -> usize {
        self.pieces.iter().filter(|p| p.status == PieceStatus::Verified).count()
    }

    /// Pieces with blocks held or requested
    pub fn pending(&self) -> usize {
        self.pieces.iter().filter(|p| p.status == PieceStatus::InProgress).count()
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_pieces() == self.total_pieces()
    }

    pub fn wasted_bytes(&self) -> u64 {
        self.wasted_bytes
    }

    pub fn hash_misses(&self) -> u64 {
        self.hash_misses
    }

    /// Payload of verified pieces
    pub fn downloaded_bytes(&self) -> u64 {
        self.verified_bytes
    }

    /// Every new block received, verified or not
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Bytes still to verify
    pub fn left_bytes(&self) -> u64 {
        self.total_size - self.verified_bytes
    }
}
