//! Piece store
//!
//! Maps piece indices to byte ranges of the backend and tracks which pieces
//! have been persisted.

use tracing::{debug, trace};

use crate::error::{Result, TorrentError};
use crate::peer::bitfield::Bitfield;
use crate::storage::backend::StorageBackend;
use crate::torrent::meta::TorrentMeta;

/// Verified piece data addressed by piece index
pub struct PieceStore {
    backend: Box<dyn StorageBackend>,
    piece_length: u32,
    total_size: u64,
    have: Bitfield,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("backend", &self.backend.storage_type())
            .field("piece_length", &self.piece_length)
            .field("total_size", &self.total_size)
            .field("have", &self.have.count())
            .finish()
    }
}

impl PieceStore {
    /// Create a store for `meta` on top of `backend`
    pub fn new(meta: &TorrentMeta, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            piece_length: meta.piece_length,
            total_size: meta.total_size,
            have: Bitfield::new(meta.piece_count()),
        }
    }

    /// Prepare the backend for writes
    pub fn initialize(&mut self) -> Result<()> {
        self.backend.initialize()
    }

    /// Whether the backend may hold data from an earlier run
    pub fn has_existing_data(&self) -> bool {
        self.backend.has_existing_data()
    }

    fn range(&self, index: u32) -> Result<(u64, usize)> {
        if index as usize >= self.have.len() {
            return Err(TorrentError::io_failure(format!("Piece {} out of range", index)));
        }
        let start = index as u64 * self.piece_length as u64;
        let end = std::cmp::min(start + self.piece_length as u64, self.total_size);
        Ok((start, (end - start) as usize))
    }

    /// Persist a verified piece and mark it held
    pub fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let (offset, length) = self.range(index)?;
        if data.len() != length {
            return Err(TorrentError::io_failure(format!(
                "Piece {} is {} bytes, expected {}",
                index,
                data.len(),
                length
            )));
        }
        debug!("Writing piece {} at offset {} ({} bytes)", index, offset, length);
        self.backend.write_at(offset, data)?;
        self.have.set(index as usize);
        Ok(())
    }

    /// Read a whole piece from the backend, held or not
    pub fn read_piece(&mut self, index: u32) -> Result<Vec<u8>> {
        let (offset, length) = self.range(index)?;
        self.backend.read_at(offset, length)
    }

    /// Read part of a held piece, for uploads
    pub fn read_block(&mut self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        let (offset, piece_len) = self.range(index)?;
        if !self.have.has(index as usize) {
            return Err(TorrentError::io_failure(format!("Piece {} not held", index)));
        }
        if begin as usize + length as usize > piece_len {
            return Err(TorrentError::protocol_violation_with_source(
                "Block outside piece",
                format!("piece {} begin {} length {}", index, begin, length),
            ));
        }
        trace!("Reading block {}:{}+{}", index, begin, length);
        self.backend.read_at(offset + begin as u64, length as usize)
    }

    /// Mark a piece as held without writing (resume)
    pub fn mark_held(&mut self, index: u32) {
        self.have.set(index as usize);
    }

    /// Forget a held piece
    pub fn unmark_held(&mut self, index: u32) {
        self.have.clear(index as usize);
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have.has(index as usize)
    }

    /// Held pieces
    pub fn bitfield(&self) -> &Bitfield {
        &self.have
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryStorage;
    use crate::torrent::meta::{create_descriptor, TorrentMeta};

    fn meta() -> TorrentMeta {
        let bytes = create_descriptor("x", 1024, &[0u8; 2500], &[]).unwrap();
        TorrentMeta::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_write_and_read_block() {
        let meta = meta();
        let mut store = PieceStore::new(&meta, Box::new(MemoryStorage::new(meta.total_size)));
        let data = vec![9u8; 452];
        store.write_piece(2, &data).unwrap();

        assert!(store.has_piece(2));
        assert!(!store.has_piece(1));
        assert_eq!(store.read_block(2, 100, 10).unwrap(), vec![9u8; 10]);
        assert_eq!(store.bitfield().count(), 1);
    }

    #[test]
    fn test_write_wrong_size_rejected() {
        let meta = meta();
        let mut store = PieceStore::new(&meta, Box::new(MemoryStorage::new(meta.total_size)));
        assert!(store.write_piece(0, &[0u8; 10]).is_err());
        assert!(store.write_piece(3, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_read_block_requires_held_piece() {
        let meta = meta();
        let mut store = PieceStore::new(&meta, Box::new(MemoryStorage::new(meta.total_size)));
        assert!(store.read_block(0, 0, 16).is_err());
        store.write_piece(0, &[1u8; 1024]).unwrap();
        assert!(store.read_block(0, 1020, 16).is_err());
    }
}
