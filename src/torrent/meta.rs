//! Torrent descriptor model
//!
//! Parses `.torrent` files into an immutable [`TorrentMeta`] and maps byte
//! ranges of the torrent onto its files.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TorrentError};

/// Raw top-level descriptor; `info` is kept as a value so it can be re-encoded for hashing
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    info: Value,
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Serialize)]
struct RawOutput<'a> {
    announce: &'a str,
    #[serde(rename = "announce-list", skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

/// One file of the torrent layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Offset of the first byte of this file within the torrent
    pub offset: u64,
}

/// Portion of a torrent byte range that falls inside one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    /// Index into [`TorrentMeta::files`]
    pub file_index: usize,
    /// Offset inside the file
    pub file_offset: u64,
    /// Offset inside the requested range
    pub range_offset: usize,
    pub length: usize,
}

/// Immutable parsed descriptor
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    pub total_size: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    /// Announce urls, primary first, duplicates removed
    pub trackers: Vec<String>,
    pub info_hash: [u8; 20],
}

impl TorrentMeta {
    /// Read and parse a descriptor from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading torrent file: {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::descriptor_error_with_source(
                format!("Failed to read torrent file '{}'", path.display()),
                e.to_string(),
            )
        })?;
        Self::from_bytes(&data)
    }

    /// Parse a bencoded descriptor
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        debug!("Parsing torrent descriptor ({} bytes)", data.len());
        let raw: RawDescriptor = serde_bencode::from_bytes(data)?;

        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();
        let info: RawInfo = serde_bencode::from_bytes(&info_bytes)?;

        if info.piece_length == 0 || info.piece_length > u32::MAX as u64 {
            return Err(TorrentError::descriptor_error(format!(
                "Invalid piece length {}",
                info.piece_length
            )));
        }
        let piece_hashes = parse_piece_hashes(&info.pieces)?;
        let files = build_layout(&info)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();

        let expected = total_size.div_ceil(info.piece_length);
        if expected != piece_hashes.len() as u64 {
            error!(
                "Piece count mismatch: {} hashes for {} bytes at {} per piece",
                piece_hashes.len(),
                total_size,
                info.piece_length
            );
            return Err(TorrentError::descriptor_error_with_source(
                "Piece hash count does not match content size",
                format!("expected {}, got {}", expected, piece_hashes.len()),
            ));
        }

        let trackers = collect_trackers(raw.announce, raw.announce_list);
        if trackers.is_empty() {
            warn!("Torrent '{}' lists no trackers", info.name);
        }

        let meta = Self {
            name: info.name,
            total_size,
            piece_length: info.piece_length as u32,
            piece_hashes,
            files,
            trackers,
            info_hash,
        };
        info!(
            "Parsed torrent '{}': {} bytes, {} pieces, info hash {}",
            meta.name,
            meta.total_size,
            meta.piece_count(),
            meta.info_hash_hex()
        );
        Ok(meta)
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of one piece; the last piece may be short
    pub fn piece_size(&self, index: u32) -> u32 {
        match self.piece_range(index) {
            Some((start, end)) => (end - start) as u32,
            None => 0,
        }
    }

    /// Byte range `[start, end)` covered by a piece
    pub fn piece_range(&self, index: u32) -> Option<(u64, u64)> {
        if index as usize >= self.piece_hashes.len() {
            return None;
        }
        let start = index as u64 * self.piece_length as u64;
        let end = std::cmp::min(start + self.piece_length as u64, self.total_size);
        Some((start, end))
    }

    /// Expected digest of a piece
    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    /// Split a torrent byte range into per-file spans
    pub fn file_spans(&self, offset: u64, length: usize) -> Vec<FileSpan> {
        let mut spans = Vec::new();
        let end = offset + length as u64;
        for (file_index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file_end <= offset || file.length == 0 {
                continue;
            }
            if file.offset >= end {
                break;
            }
            let start = std::cmp::max(offset, file.offset);
            let stop = std::cmp::min(end, file_end);
            spans.push(FileSpan {
                file_index,
                file_offset: start - file.offset,
                range_offset: (start - offset) as usize,
                length: (stop - start) as usize,
            });
        }
        spans
    }

    /// Info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Split the concatenated `pieces` field into digests
pub fn parse_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces.len() % 20 != 0 {
        return Err(TorrentError::descriptor_error(format!(
            "Pieces field length must be a multiple of 20, got {}",
            pieces.len()
        )));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// True when `part` is made only of plain names, so joining it cannot leave the download directory
fn is_plain_relative(part: &str) -> bool {
    let mut components = Path::new(part).components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

fn build_layout(info: &RawInfo) -> Result<Vec<FileEntry>> {
    if !is_plain_relative(&info.name) {
        return Err(TorrentError::descriptor_error_with_source(
            "Invalid name in descriptor",
            info.name.clone(),
        ));
    }
    match (&info.files, info.length) {
        (Some(files), _) => {
            let mut offset = 0u64;
            let mut layout = Vec::with_capacity(files.len());
            for file in files {
                if file.path.is_empty() || !file.path.iter().all(|c| is_plain_relative(c)) {
                    return Err(TorrentError::descriptor_error_with_source(
                        "Invalid file path in descriptor",
                        file.path.join("/"),
                    ));
                }
                let mut path = PathBuf::from(&info.name);
                path.extend(&file.path);
                layout.push(FileEntry {
                    path,
                    length: file.length,
                    offset,
                });
                offset += file.length;
            }
            Ok(layout)
        }
        (None, Some(length)) => Ok(vec![FileEntry {
            path: PathBuf::from(&info.name),
            length,
            offset: 0,
        }]),
        (None, None) => Err(TorrentError::descriptor_error(
            "Descriptor has neither 'length' nor 'files'",
        )),
    }
}

fn collect_trackers(announce: Option<String>, announce_list: Option<Vec<Vec<String>>>) -> Vec<String> {
    let mut trackers: Vec<String> = Vec::new();
    let tiers = announce_list.unwrap_or_default();
    for url in announce.into_iter().chain(tiers.into_iter().flatten()) {
        let url = url.trim().to_string();
        if !url.is_empty() && !trackers.contains(&url) {
            trackers.push(url);
        }
    }
    trackers
}

/// Build a single-file descriptor for `content`.
///
/// Used to seed freshly created content and by tests that need real descriptors.
pub fn create_descriptor(name: &str, piece_length: u32, content: &[u8], trackers: &[String]) -> Result<Vec<u8>> {
    if piece_length == 0 {
        return Err(TorrentError::descriptor_error("Piece length cannot be 0"));
    }
    let mut pieces = Vec::with_capacity(content.len().div_ceil(piece_length as usize) * 20);
    for chunk in content.chunks(piece_length as usize) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    let output = RawOutput {
        announce: trackers.first().map(String::as_str).unwrap_or(""),
        announce_list: if trackers.len() > 1 {
            Some(trackers.iter().map(|t| vec![t.clone()]).collect())
        } else {
            None
        },
        info: RawInfo {
            name: name.to_string(),
            piece_length: piece_length as u64,
            pieces: ByteBuf::from(pieces),
            length: Some(content.len() as u64),
            files: None,
        },
    };
    Ok(serde_bencode::to_bytes(&output)?)
}
