//! File storage module
//!
//! Maps the flat torrent byte range onto the files of the torrent layout.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace};

use crate::error::{Result, TorrentError};
use crate::storage::backend::{StorageBackend, StorageType};
use crate::torrent::meta::TorrentMeta;

/// File-backed storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    meta: TorrentMeta,
    /// Open handles, indexed like the layout
    handles: Vec<Option<File>>,
}

impl FileStorage {
    /// Create a new file storage rooted at `base_path`
    pub fn new(base_path: PathBuf, meta: &TorrentMeta) -> Self {
        debug!("Creating file storage for '{}' in {}", meta.name, base_path.display());
        Self {
            base_path,
            meta: meta.clone(),
            handles: (0..meta.files.len()).map(|_| None).collect(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Absolute path of a layout entry
    pub fn file_path(&self, index: usize) -> PathBuf {
        self.base_path.join(&self.meta.files[index].path)
    }

    fn handle(&mut self, index: usize) -> Result<&mut File> {
        if self.handles[index].is_none() {
            let path = self.file_path(index);
            let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
                error!("Failed to open file '{}': {}", path.display(), e);
                TorrentError::io_failure_full("Failed to open file", path.display().to_string(), e.to_string())
            })?;
            self.handles[index] = Some(file);
        }
        match self.handles[index].as_mut() {
            Some(file) => Ok(file),
            None => Err(TorrentError::io_failure("File handle unavailable")),
        }
    }
}

impl StorageBackend for FileStorage {
    fn initialize(&mut self) -> Result<()> {
        info!("Creating file structure in {}", self.base_path.display());
        for index in 0..self.meta.files.len() {
            let path = self.file_path(index);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::io_failure_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", path.display(), e);
                    TorrentError::io_failure_full("Failed to create file", path.display().to_string(), e.to_string())
                })?;
            let length = self.meta.files[index].length;
            if file.metadata().map(|m| m.len()).unwrap_or(0) != length {
                debug!("Sizing file {} to {} bytes", path.display(), length);
                file.set_len(length).map_err(|e| {
                    error!("Failed to set file length for '{}': {}", path.display(), e);
                    TorrentError::io_failure_full("Failed to set file length", path.display().to_string(), e.to_string())
                })?;
            }
            self.handles[index] = Some(file);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing data at offset {} ({} bytes)", offset, data.len());
        for span in self.meta.file_spans(offset, data.len()) {
            let path = self.file_path(span.file_index);
            let file = self.handle(span.file_index)?;
            file.seek(SeekFrom::Start(span.file_offset))
                .and_then(|_| file.write_all(&data[span.range_offset..span.range_offset + span.length]))
                .map_err(|e| {
                    error!("Failed to write to file '{}': {}", path.display(), e);
                    TorrentError::io_failure_full("Failed to write to file", path.display().to_string(), e.to_string())
                })?;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        trace!("Reading data at offset {} ({} bytes)", offset, length);
        let mut buffer = vec![0u8; length];
        for span in self.meta.file_spans(offset, length) {
            let path = self.file_path(span.file_index);
            let file = self.handle(span.file_index)?;
            file.seek(SeekFrom::Start(span.file_offset))
                .and_then(|_| file.read_exact(&mut buffer[span.range_offset..span.range_offset + span.length]))
                .map_err(|e| {
                    error!("Failed to read from file '{}': {}", path.display(), e);
                    TorrentError::io_failure_full("Failed to read from file", path.display().to_string(), e.to_string())
                })?;
        }
        Ok(buffer)
    }

    fn has_existing_data(&self) -> bool {
        (0..self.meta.files.len()).any(|i| self.file_path(i).exists())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::meta::FileEntry;

    fn multi_file_meta() -> TorrentMeta {
        TorrentMeta {
            name: "multi".to_string(),
            total_size: 30,
            piece_length: 16,
            piece_hashes: vec![[0u8; 20]; 2],
            files: vec![
                FileEntry { path: PathBuf::from("multi/a.bin"), length: 10, offset: 0 },
                FileEntry { path: PathBuf::from("multi/sub/b.bin"), length: 20, offset: 10 },
            ],
            trackers: vec![],
            info_hash: [0u8; 20],
        }
    }

    #[test]
    fn test_initialize_creates_sized_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().to_path_buf(), &multi_file_meta());
        assert!(!storage.has_existing_data());

        storage.initialize().unwrap();

        assert_eq!(fs::metadata(dir.path().join("multi/a.bin")).unwrap().len(), 10);
        assert_eq!(fs::metadata(dir.path().join("multi/sub/b.bin")).unwrap().len(), 20);
        assert!(storage.has_existing_data());
    }

    #[test]
    fn test_write_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().to_path_buf(), &multi_file_meta());
        storage.initialize().unwrap();

        let data: Vec<u8> = (0..16).collect();
        storage.write_at(4, &data).unwrap();

        assert_eq!(storage.read_at(4, 16).unwrap(), data);
        let a = fs::read(dir.path().join("multi/a.bin")).unwrap();
        assert_eq!(&a[4..], &data[..6]);
        let b = fs::read(dir.path().join("multi/sub/b.bin")).unwrap();
        assert_eq!(&b[..10], &data[6..]);
    }

    #[test]
    fn test_read_without_initialize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().to_path_buf(), &multi_file_meta());
        let err = storage.read_at(0, 4).unwrap_err();
        assert!(matches!(err, TorrentError::IoFailure { .. }));
    }
}
