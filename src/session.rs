//! Session module
//!
//! Drives every torrent of one process through a shared multiplexer: the
//! download phase, then optionally the seed phase. Each torrent is tracked in
//! one of a few id sets so the driver can tell when a phase is over and what
//! to report at the end.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::cli::progress::format_bytes;
use crate::config::Config;
use crate::error::{Result, TorrentError};
use crate::net::{Multiplexer, TorrentId};
use crate::torrent::{DownloadState, Torrent, TorrentStats};

/// Final result of one torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Could not be opened, prepared or stored
    Failed,
    /// Downloaded, but no way was left to keep seeding it
    SeedFailed,
    Incomplete,
}

/// A torrent slot; `torrent` is empty when the descriptor could not be opened
#[derive(Debug)]
struct Entry {
    label: String,
    torrent: Option<Torrent>,
}

/// All torrents of one process
#[derive(Debug)]
pub struct Session {
    config: Config,
    mux: Multiplexer,
    entries: Vec<Entry>,
    completed: BTreeSet<TorrentId>,
    errored: BTreeSet<TorrentId>,
    seeding_failed: BTreeSet<TorrentId>,
    /// Seeded until no peers or trackers were left
    seed_finished: BTreeSet<TorrentId>,
    active: BTreeSet<TorrentId>,
    seeding: bool,
}

impl Session {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            mux: Multiplexer::new()?,
            entries: Vec::new(),
            completed: BTreeSet::new(),
            errored: BTreeSet::new(),
            seeding_failed: BTreeSet::new(),
            seed_finished: BTreeSet::new(),
            active: BTreeSet::new(),
            seeding: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the descriptor at `path`.
    ///
    /// A descriptor that cannot be opened still takes an id, is marked failed
    /// and its error is returned.
    pub fn add(&mut self, path: &Path) -> Result<TorrentId> {
        let id = self.entries.len();
        match Torrent::open(path, id, &self.config) {
            Ok(torrent) => {
                self.entries.push(Entry {
                    label: torrent.name().to_string(),
                    torrent: Some(torrent),
                });
                Ok(id)
            }
            Err(e) => {
                error!("Cannot open {}: {}", path.display(), e);
                self.entries.push(Entry {
                    label: path.display().to_string(),
                    torrent: None,
                });
                self.errored.insert(id);
                Err(e)
            }
        }
    }

    /// Add an already built torrent under the next id
    pub fn add_torrent(&mut self, build: impl FnOnce(TorrentId, &Config) -> Torrent) -> TorrentId {
        let id = self.entries.len();
        let torrent = build(id, &self.config);
        self.entries.push(Entry {
            label: torrent.name().to_string(),
            torrent: Some(torrent),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn torrent(&self, id: TorrentId) -> Option<&Torrent> {
        self.entries.get(id).and_then(|e| e.torrent.as_ref())
    }

    /// Name of the torrent, or the descriptor path when it never opened
    pub fn label(&self, id: TorrentId) -> Option<&str> {
        self.entries.get(id).map(|e| e.label.as_str())
    }

    /// Check local content of every torrent without networking.
    ///
    /// Returns the info lines to show; inspected torrents count as completed.
    pub fn inspect(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for (id, entry) in self.entries.iter_mut().enumerate() {
            let Some(torrent) = entry.torrent.as_mut() else {
                continue;
            };
            torrent.inspect();
            let meta = torrent.meta();
            let pieces = torrent.pieces();
            lines.push(format!("{}: Total size: {}", meta.name, format_bytes(meta.total_size)));
            lines.push(format!(
                "{}: Completed pieces: {}/{}",
                meta.name,
                pieces.completed_pieces(),
                pieces.total_pieces()
            ));
            lines.push(format!("{}: Piece length: {}", meta.name, meta.piece_length));
            self.completed.insert(id);
        }
        lines
    }

    /// Prepare every opened torrent for download.
    ///
    /// Listener ports count up from `start_port`; a start port of 0 lets the
    /// system pick one per torrent.
    pub fn prepare_all(&mut self, now: Instant) -> Vec<(TorrentId, DownloadState)> {
        let mut states = Vec::new();
        let mut offset: u16 = 0;
        for (id, entry) in self.entries.iter_mut().enumerate() {
            let Some(torrent) = entry.torrent.as_mut() else {
                continue;
            };
            let port = if self.config.start_port == 0 {
                0
            } else {
                self.config.start_port.saturating_add(offset)
            };
            offset = offset.saturating_add(1);

            let state = torrent.prepare(port, self.config.seed, &mut self.mux, now);
            match state {
                DownloadState::None => {
                    self.active.insert(id);
                }
                DownloadState::Completed => {
                    self.completed.insert(id);
                }
                DownloadState::Error => {
                    self.errored.insert(id);
                }
            }
            states.push((id, state));
        }
        info!("{} torrents downloading, {} already complete", self.active.len(), self.completed.len());
        states
    }

    /// Queue peer addresses for a torrent, in addition to tracker results
    pub fn add_peers(&mut self, id: TorrentId, addrs: impl IntoIterator<Item = SocketAddr>) {
        if let Some(torrent) = self.entries.get_mut(id).and_then(|e| e.torrent.as_mut()) {
            torrent.add_candidates(addrs);
        }
    }

    /// One iteration of the download phase, ending in one multiplexer wait
    pub fn download_step(&mut self, now: Instant) -> Result<()> {
        let ids: Vec<TorrentId> = self.active.iter().copied().collect();
        for id in ids {
            let Some(torrent) = self.entries.get_mut(id).and_then(|e| e.torrent.as_mut()) else {
                self.active.remove(&id);
                continue;
            };

            if torrent.is_failed() {
                if let Some(e) = torrent.failure() {
                    error!("'{}' failed: {}", torrent.name(), e);
                }
                torrent.stop(&mut self.mux, now);
                self.active.remove(&id);
                self.errored.insert(id);
                continue;
            }

            if torrent.is_finished() {
                if self.config.seed {
                    torrent.finish(&mut self.mux, now);
                } else {
                    torrent.stop(&mut self.mux, now);
                }
                self.active.remove(&id);
                self.completed.insert(id);
                continue;
            }

            if self.config.allows_more_peers(torrent.active_peers()) {
                torrent.check_trackers(&mut self.mux, now);
            }
            torrent.next_connection(&mut self.mux, now);
            torrent.tick(&mut self.mux, now);

            if torrent.is_stalled() {
                warn!("'{}' has no peers and no trackers left", torrent.name());
                if let Some(e) = torrent.last_tracker_error() {
                    debug!("Last tracker error: {}", e);
                }
                torrent.stop(&mut self.mux, now);
                self.active.remove(&id);
                self.errored.insert(id);
            }
        }

        self.poll(now)
    }

    /// Download phase over: every torrent completed or failed
    pub fn is_download_done(&self) -> bool {
        self.active.is_empty()
    }

    /// Enter the seed phase; completed torrents without trackers cannot seed
    pub fn start_seeding(&mut self) {
        if self.seeding {
            return;
        }
        self.seeding = true;
        for &id in &self.completed {
            let Some(torrent) = self.entries.get(id).and_then(|e| e.torrent.as_ref()) else {
                continue;
            };
            if !torrent.has_trackers() {
                warn!("'{}' has no usable tracker to seed through", torrent.name());
                self.seeding_failed.insert(id);
            }
        }
        info!("Seeding {} torrents", self.seeding_ids().len());
    }

    fn seeding_ids(&self) -> Vec<TorrentId> {
        self.completed
            .iter()
            .filter(|id| !self.seeding_failed.contains(*id) && !self.seed_finished.contains(*id))
            .copied()
            .collect()
    }

    /// One iteration of the seed phase
    pub fn seed_step(&mut self, now: Instant) -> Result<()> {
        self.start_seeding();
        for id in self.seeding_ids() {
            let Some(torrent) = self.entries.get_mut(id).and_then(|e| e.torrent.as_mut()) else {
                self.seeding_failed.insert(id);
                continue;
            };
            if torrent.is_failed() {
                if let Some(e) = torrent.failure() {
                    error!("'{}' failed while seeding: {}", torrent.name(), e);
                }
                torrent.stop(&mut self.mux, now);
                self.seeding_failed.insert(id);
                continue;
            }
            let connected = torrent.next_connection(&mut self.mux, now);
            let below_cap = self.config.allows_more_peers(torrent.active_peers());
            if !connected || (below_cap && !torrent.check_trackers(&mut self.mux, now)) {
                info!("'{}' has nobody left to seed to", torrent.name());
                torrent.stop(&mut self.mux, now);
                self.seed_finished.insert(id);
                continue;
            }
            torrent.tick(&mut self.mux, now);
        }

        self.poll(now)
    }

    /// Seed phase over: no completed torrent is seeding any longer
    pub fn is_seed_done(&self) -> bool {
        self.seeding_ids().is_empty()
    }

    /// Service every ready socket once
    fn poll(&mut self, now: Instant) -> Result<()> {
        let entries = &mut self.entries;
        self.mux
            .poll(self.config.poll_timeout, |owner, readiness, mux| {
                if let Some(torrent) = entries.get_mut(owner.torrent).and_then(|e| e.torrent.as_mut()) {
                    torrent.dispatch(owner.endpoint, readiness, mux, now);
                }
            })
            .map(|_| ())
    }

    /// Statistics of every opened torrent
    pub fn stats(&mut self, now: Instant) -> Vec<TorrentStats> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.torrent.as_mut())
            .map(|t| t.stats(now))
            .collect()
    }

    /// Announce `stopped` everywhere and close all connections
    pub fn shutdown(&mut self, now: Instant) {
        for torrent in self.entries.iter_mut().filter_map(|e| e.torrent.as_mut()) {
            torrent.stop(&mut self.mux, now);
        }
    }

    /// Outcome of every torrent, in id order
    pub fn report(&self) -> Vec<(TorrentId, String, Outcome)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, entry)| {
                let outcome = if self.seeding_failed.contains(&id) {
                    Outcome::SeedFailed
                } else if self.completed.contains(&id) {
                    Outcome::Completed
                } else if self.errored.contains(&id) {
                    Outcome::Failed
                } else {
                    Outcome::Incomplete
                };
                (id, entry.label.clone(), outcome)
            })
            .collect()
    }

    /// First error of a torrent that failed, if it is known
    pub fn failure(&self, id: TorrentId) -> Option<&TorrentError> {
        self.torrent(id).and_then(|t| t.failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::torrent::{create_descriptor, TorrentMeta};

    fn config() -> Config {
        Config {
            start_port: 0,
            ..Config::default()
        }
    }

    fn meta(len: usize) -> (TorrentMeta, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 13) as u8).collect();
        let descriptor = create_descriptor("session.bin", 16 * 1024, &data, &[]).unwrap();
        (TorrentMeta::from_bytes(&descriptor).unwrap(), data)
    }

    #[test]
    fn test_unreadable_descriptor_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(config()).unwrap();
        let missing = dir.path().join("missing.torrent");
        assert!(session.add(&missing).is_err());
        assert_eq!(session.len(), 1);
        assert!(session.is_download_done());
        assert_eq!(session.report()[0].2, Outcome::Failed);
    }

    #[test]
    fn test_prepare_all_sorts_torrents() {
        let mut session = Session::new(config()).unwrap();
        let (meta_a, data) = meta(20_000);
        let (meta_b, _) = meta(20_000);
        let complete = session.add_torrent(|id, config| {
            Torrent::with_backend(meta_a, Box::new(MemoryStorage::with_data(data)), id, config)
        });
        let fresh = session.add_torrent(|id, config| {
            Torrent::with_backend(meta_b, Box::new(MemoryStorage::new(20_000)), id, config)
        });

        let states = session.prepare_all(Instant::now());
        assert_eq!(states, vec![(complete, DownloadState::Completed), (fresh, DownloadState::None)]);
        assert!(!session.is_download_done());

        // no trackers and no peers: the fresh download stalls and fails
        session.download_step(Instant::now()).unwrap();
        assert!(session.is_download_done());
        let report = session.report();
        assert_eq!(report[complete].2, Outcome::Completed);
        assert_eq!(report[fresh].2, Outcome::Failed);
    }

    #[test]
    fn test_seeding_without_trackers_fails() {
        let mut session = Session::new(config()).unwrap();
        let (meta, data) = meta(1000);
        let id = session.add_torrent(|id, config| {
            Torrent::with_backend(meta, Box::new(MemoryStorage::with_data(data)), id, config)
        });
        session.prepare_all(Instant::now());
        assert!(!session.is_seed_done());
        session.start_seeding();
        assert!(session.is_seed_done());
        assert_eq!(session.report()[id].2, Outcome::SeedFailed);
    }

    #[test]
    fn test_inspect_lines() {
        let mut session = Session::new(config()).unwrap();
        let (meta, data) = meta(40_000);
        session.add_torrent(|id, config| Torrent::with_backend(meta, Box::new(MemoryStorage::with_data(data)), id, config));
        let lines = session.inspect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("Completed pieces: 3/3"));
        assert_eq!(lines[2], "session.bin: Piece length: 16384");
        assert_eq!(session.report()[0].2, Outcome::Completed);
    }
}
