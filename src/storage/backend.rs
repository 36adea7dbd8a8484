//! Storage backend abstraction
//!
//! The piece store addresses torrent content as one flat byte range; a backend
//! decides where those bytes live.

use tracing::trace;

use crate::error::{Result, TorrentError};

/// Flat byte-range storage for one torrent
pub trait StorageBackend {
    /// Prepare the backing storage (create files, allocate memory)
    fn initialize(&mut self) -> Result<()>;

    /// Write `data` at torrent offset `offset`
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Read `length` bytes from torrent offset `offset`
    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Whether content from an earlier run may be present
    fn has_existing_data(&self) -> bool;

    /// Storage type identifier
    fn storage_type(&self) -> StorageType;
}

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Local filesystem storage
    File,
    /// In-memory storage
    Memory,
}

/// Content held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
    preloaded: bool,
}

impl MemoryStorage {
    /// Empty storage of `total_size` zero bytes
    pub fn new(total_size: u64) -> Self {
        Self {
            data: vec![0; total_size as usize],
            preloaded: false,
        }
    }

    /// Storage pre-filled with existing content
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, preloaded: true }
    }

    /// Stored content
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn bounds(&self, offset: u64, length: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                TorrentError::io_failure(format!(
                    "Range {}+{} outside of {} bytes",
                    offset,
                    length,
                    self.data.len()
                ))
            })?;
        Ok(start..end)
    }
}

impl StorageBackend for MemoryStorage {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Memory write at {} ({} bytes)", offset, data.len());
        let range = self.bounds(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let range = self.bounds(offset, length)?;
        Ok(self.data[range].to_vec())
    }

    fn has_existing_data(&self) -> bool {
        self.preloaded
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }
}
