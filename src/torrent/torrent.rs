//! Torrent module
//!
//! One torrent's swarm: its listener, tracker clients, peer connections and
//! piece manager. All methods are non-blocking and take the current time
//! explicitly; the session drives them from the poll loop.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, MAX_BLOCK_SIZE};
use crate::error::{Result, TorrentError};
use crate::net::{Endpoint, Multiplexer, Owner, Readiness, TorrentId};
use crate::peer::{ConnectionLimits, PeerConnection};
use crate::protocol::Message;
use crate::storage::{FileStorage, PieceManager, PieceStore, StorageBackend, VerifyResult};
use crate::torrent::meta::TorrentMeta;
use crate::torrent::stats::{estimate_eta, SpeedMeter, TorrentStats};
use crate::tracker::{AnnounceEvent, TrackerClient, TransferProgress};

/// Result of preparing a torrent for download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    /// Ready to download
    #[default]
    None,
    /// Every piece is already present and verified
    Completed,
    /// Storage or listener could not be set up
    Error,
}

/// A connection plus its multiplexer registration
#[derive(Debug)]
struct Peer {
    conn: PeerConnection,
    token: Token,
    /// Our bitfield has been sent
    greeted: bool,
}

/// Piece bookkeeping and counters, kept apart from the peer map so both can
/// be borrowed at once
#[derive(Debug)]
struct Transfer {
    pieces: PieceManager,
    downloaded: u64,
    uploaded: u64,
    speed: SpeedMeter,
    max_uploads: usize,
    failure: Option<TorrentError>,
}

impl Transfer {
    /// Apply one message from `peer`; returns a newly verified piece
    fn handle_message(&mut self, peer: &mut Peer, message: Message, now: Instant) -> Option<u32> {
        let addr = peer.conn.addr();
        match message {
            Message::Have { piece_index } => {
                self.pieces.peer_has_piece(piece_index);
                self.update_interest(&mut peer.conn);
            }
            Message::Bitfield { .. } => {
                self.pieces.peer_has_bitfield(peer.conn.peer_bitfield());
                self.update_interest(&mut peer.conn);
            }
            Message::Choke => {
                self.pieces.release_peer(&addr);
            }
            Message::NotInterested => {
                peer.conn.set_choking(true);
            }
            Message::Piece { index, begin, block } => {
                let len = block.len() as u64;
                self.downloaded += len;
                self.speed.record(now, len);
                match self.pieces.on_block_received(addr, index, begin, block) {
                    Ok(VerifyResult::Verified(index)) => return Some(index),
                    Ok(VerifyResult::HashMismatch(index)) => {
                        warn!("Piece {} from swarm failed verification, last block from {}", index, addr);
                    }
                    Ok(VerifyResult::Accepted) | Ok(VerifyResult::Duplicate) => {}
                    Err(e) if e.is_fatal_to_torrent() => {
                        error!("Storage failure: {}", e);
                        self.failure = Some(e);
                    }
                    Err(e) => peer.conn.close(e.with_peer(addr.to_string()).to_string()),
                }
            }
            Message::KeepAlive
            | Message::Unchoke
            | Message::Interested
            | Message::Request { .. }
            | Message::Cancel { .. }
            | Message::Port { .. } => {}
        }
        None
    }

    fn update_interest(&self, conn: &mut PeerConnection) {
        if conn.state().is_established() {
            let interested = !self.pieces.is_complete() && self.pieces.is_interesting(conn.peer_bitfield());
            conn.set_interested(interested);
        }
    }

    /// Fill the peer's request pipeline
    fn refill(&mut self, conn: &mut PeerConnection) {
        if self.failure.is_some() {
            return;
        }
        let addr = conn.addr();
        while conn.can_request() {
            let Some(request) = self.pieces.select_next_request(addr, conn.peer_bitfield()) else {
                break;
            };
            if !conn.queue_request(request) {
                self.pieces.release(&addr, request.piece, request.block);
                break;
            }
        }
        conn.flush_requests();
    }

    /// Answer queued requests for pieces we hold
    fn serve_uploads(&mut self, conn: &mut PeerConnection) {
        while let Some((index, begin, length)) = conn.next_upload() {
            if length == 0 || length > MAX_BLOCK_SIZE || !self.pieces.has_piece(index) {
                trace!("Ignoring request {}:{}+{} from {}", index, begin, length, conn.addr());
                continue;
            }
            match self.pieces.read_block(index, begin, length) {
                Ok(block) => {
                    self.uploaded += block.len() as u64;
                    conn.send_block(index, begin, block);
                }
                Err(e) => {
                    warn!("Cannot serve {}:{} to {}: {}", index, begin, conn.addr(), e);
                }
            }
        }
    }
}

/// One torrent being downloaded or seeded
#[derive(Debug)]
pub struct Torrent {
    id: TorrentId,
    meta: TorrentMeta,
    config: Config,
    limits: ConnectionLimits,
    state: DownloadState,
    port: u16,
    listener: Option<(TcpListener, Token)>,
    peers: HashMap<SocketAddr, Peer>,
    candidates: VecDeque<SocketAddr>,
    trackers: Vec<TrackerClient>,
    last_tracker_error: Option<TorrentError>,
    transfer: Transfer,
    seed_after: bool,
    finished: bool,
    stopped: bool,
}

impl Torrent {
    /// Parse the descriptor at `path`; content goes under the configured download directory
    pub fn open(path: &Path, id: TorrentId, config: &Config) -> Result<Self> {
        let meta = TorrentMeta::from_file(path)?;
        let storage = FileStorage::new(config.download_dir.clone(), &meta);
        Ok(Self::with_backend(meta, Box::new(storage), id, config))
    }

    /// Build a torrent over any storage backend
    pub fn with_backend(meta: TorrentMeta, backend: Box<dyn StorageBackend>, id: TorrentId, config: &Config) -> Self {
        let store = PieceStore::new(&meta, backend);
        let pieces = PieceManager::new(&meta, store, config.block_size, config.pipeline_depth);
        Self {
            id,
            meta,
            config: config.clone(),
            limits: ConnectionLimits::from(config),
            state: DownloadState::None,
            port: 0,
            listener: None,
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            trackers: Vec::new(),
            last_tracker_error: None,
            transfer: Transfer {
                pieces,
                downloaded: 0,
                uploaded: 0,
                speed: SpeedMeter::new(),
                max_uploads: config.max_uploads,
                failure: None,
            },
            seed_after: config.seed,
            finished: false,
            stopped: false,
        }
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Port the listener is bound to, once prepared
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pieces(&self) -> &PieceManager {
        &self.transfer.pieces
    }

    /// Storage failure that ended this torrent
    pub fn failure(&self) -> Option<&TorrentError> {
        self.transfer.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.state == DownloadState::Error || self.transfer.failure.is_some()
    }

    pub fn last_tracker_error(&self) -> Option<&TorrentError> {
        self.last_tracker_error.as_ref()
    }

    /// Check existing content without touching the network
    pub fn inspect(&mut self) -> usize {
        self.transfer.pieces.check_existing()
    }

    /// Set up storage, the listener and the trackers.
    ///
    /// Returns `Completed` when every piece already verifies, `Error` when the
    /// data files or the listener cannot be created. Once set the state is
    /// returned unchanged by later calls.
    pub fn prepare(&mut self, port: u16, seed_after: bool, mux: &mut Multiplexer, now: Instant) -> DownloadState {
        if self.state != DownloadState::None || self.listener.is_some() {
            return self.state;
        }
        self.seed_after = seed_after;

        if let Err(e) = self.transfer.pieces.initialize_store() {
            error!("Cannot create data files for '{}': {}", self.meta.name, e);
            self.state = DownloadState::Error;
            return self.state;
        }
        let found = self.transfer.pieces.check_existing();
        debug!("'{}': {} pieces present before download", self.meta.name, found);

        match self.listen(port, mux) {
            Ok(bound) => self.port = bound,
            Err(e) => {
                error!("Cannot listen on port {} for '{}': {}", port, self.meta.name, e);
                self.state = DownloadState::Error;
                return self.state;
            }
        }

        self.trackers = self
            .meta
            .trackers
            .iter()
            .enumerate()
            .map(|(i, url)| {
                TrackerClient::new(url, Owner::new(self.id, Endpoint::Tracker(i)), self.meta.info_hash, self.port, &self.config, now)
            })
            .collect();

        if self.transfer.pieces.is_complete() {
            info!("'{}' is already complete", self.meta.name);
            self.state = DownloadState::Completed;
            self.finished = true;
            if !seed_after {
                return self.state;
            }
        }
        self.check_trackers(mux, now);
        self.state
    }

    fn listen(&mut self, port: u16, mux: &mut Multiplexer) -> io::Result<u16> {
        let mut listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let bound = listener.local_addr()?.port();
        let token = mux.register(&mut listener, Owner::new(self.id, Endpoint::Listener), Interest::READABLE)?;
        info!("'{}' listening on port {}", self.meta.name, bound);
        self.listener = Some((listener, token));
        Ok(bound)
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            uploaded: self.transfer.uploaded,
            downloaded: self.transfer.downloaded,
            left: self.transfer.pieces.left_bytes(),
        }
    }

    /// Harvest finished announces and re-announce to due trackers.
    ///
    /// Returns whether any tracker is still usable.
    pub fn check_trackers(&mut self, mux: &mut Multiplexer, now: Instant) -> bool {
        let progress = self.progress();
        let mut found = Vec::new();
        for tracker in &mut self.trackers {
            tracker.tick(now, mux);
            match tracker.poll() {
                Some(Ok(result)) => found.extend(result.peers),
                Some(Err(e)) => self.last_tracker_error = Some(e),
                None => {}
            }
            if !self.stopped && tracker.is_due(now) {
                if let Err(e) = tracker.announce(AnnounceEvent::None, progress, now, mux) {
                    self.last_tracker_error = Some(e);
                }
            }
        }
        self.add_candidates(found);
        self.has_trackers()
    }

    /// Queue peer addresses to connect to; known addresses are skipped
    pub fn add_candidates(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut added = 0;
        for addr in addrs {
            if self.peers.contains_key(&addr) || self.candidates.contains(&addr) {
                continue;
            }
            self.candidates.push_back(addr);
            added += 1;
        }
        if added > 0 {
            debug!("'{}': {} new peer candidates", self.meta.name, added);
        }
    }

    /// Open one outbound connection to the next unconnected candidate.
    ///
    /// Returns `false` once no further connections can be obtained.
    pub fn next_connection(&mut self, mux: &mut Multiplexer, now: Instant) -> bool {
        if self.stopped || self.is_failed() {
            return false;
        }
        while self.config.allows_more_peers(self.peers.len()) {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            if self.peers.contains_key(&addr) {
                continue;
            }
            match self.connect(addr, mux, now) {
                Ok(()) => return true,
                Err(e) => debug!("Cannot connect to {}: {}", addr, e),
            }
        }
        self.listener.is_some() || !self.candidates.is_empty() || self.has_trackers()
    }

    fn connect(&mut self, addr: SocketAddr, mux: &mut Multiplexer, now: Instant) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        let token = mux.register(&mut stream, Owner::new(self.id, Endpoint::Peer(addr)), Interest::READABLE | Interest::WRITABLE)?;
        let conn = PeerConnection::outbound(
            stream,
            addr,
            self.meta.info_hash,
            self.config.peer_id,
            self.meta.piece_count(),
            self.limits,
            now,
        );
        self.peers.insert(addr, Peer { conn, token, greeted: false });
        Ok(())
    }

    fn accept(&mut self, mux: &mut Multiplexer, now: Instant) {
        let Some((listener, _)) = self.listener.as_mut() else {
            return;
        };
        loop {
            let (mut stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed on '{}': {}", self.meta.name, e);
                    break;
                }
            };
            if self.stopped || self.peers.contains_key(&addr) || !self.config.allows_more_peers(self.peers.len()) {
                debug!("Refusing incoming peer {}", addr);
                continue;
            }
            let owner = Owner::new(self.id, Endpoint::Peer(addr));
            match mux.register(&mut stream, owner, Interest::READABLE | Interest::WRITABLE) {
                Ok(token) => {
                    let conn = PeerConnection::inbound(
                        stream,
                        addr,
                        self.meta.info_hash,
                        self.config.peer_id,
                        self.meta.piece_count(),
                        self.limits,
                        now,
                    );
                    self.peers.insert(addr, Peer { conn, token, greeted: false });
                }
                Err(e) => warn!("Cannot register incoming peer {}: {}", addr, e),
            }
        }
    }

    /// Route readiness of one of this torrent's sockets
    pub fn dispatch(&mut self, endpoint: Endpoint, readiness: Readiness, mux: &mut Multiplexer, now: Instant) {
        match endpoint {
            Endpoint::Listener => self.accept(mux, now),
            Endpoint::Tracker(index) => {
                if let Some(tracker) = self.trackers.get_mut(index) {
                    tracker.on_ready(readiness, now, mux);
                }
            }
            Endpoint::Peer(addr) => self.service_peer(addr, Some(readiness), mux, now),
        }
    }

    /// Drive one connection: socket IO (or timers when `readiness` is
    /// `None`), message handling, requests and uploads.
    fn service_peer(&mut self, addr: SocketAddr, readiness: Option<Readiness>, mux: &mut Multiplexer, now: Instant) {
        let verified = {
            let Some(peer) = self.peers.get_mut(&addr) else {
                return;
            };
            let transfer = &mut self.transfer;

            let mut messages = Vec::new();
            match readiness {
                Some(readiness) => {
                    if readiness.writable || readiness.error {
                        peer.conn.on_writable(now);
                    }
                    if readiness.readable || readiness.closed {
                        match peer.conn.on_readable(now) {
                            Ok(received) => messages = received,
                            Err(e) => debug!("{}", e),
                        }
                    }
                }
                None => {
                    if let Err(e) = peer.conn.tick(now) {
                        debug!("{}", e);
                    }
                }
            }

            if peer.conn.state().is_established() && !peer.greeted {
                peer.conn.send_bitfield(transfer.pieces.bitfield());
                peer.greeted = true;
                transfer.update_interest(&mut peer.conn);
            }

            let mut verified = Vec::new();
            for message in messages {
                if let Some(index) = transfer.handle_message(peer, message, now) {
                    verified.push(index);
                }
            }
            if peer.conn.state().is_established() {
                transfer.refill(&mut peer.conn);
                transfer.serve_uploads(&mut peer.conn);
            }
            peer.conn.flush(now);
            verified
        };

        if !verified.is_empty() {
            self.broadcast_have(&verified, now);
        }
        self.rechoke(now);
        if self.peers.get(&addr).is_some_and(|p| p.conn.state().is_closing()) {
            self.remove_peer(addr, mux);
        }
        if let Some(e) = &self.transfer.failure {
            if self.state != DownloadState::Error {
                error!("'{}' stopped: {}", self.meta.name, e);
            }
        }
    }

    fn broadcast_have(&mut self, verified: &[u32], now: Instant) {
        info!(
            "'{}': {}/{} pieces",
            self.meta.name,
            self.transfer.pieces.completed_pieces(),
            self.transfer.pieces.total_pieces()
        );
        for peer in self.peers.values_mut() {
            if !peer.conn.state().is_established() {
                continue;
            }
            for &index in verified {
                peer.conn.send(&Message::Have { piece_index: index });
            }
            self.transfer.update_interest(&mut peer.conn);
            peer.conn.flush(now);
        }
    }

    /// Unchoke interested peers while upload slots are free; the unchoke is
    /// flushed at once since an idle torrent may not be ticked
    fn rechoke(&mut self, now: Instant) {
        let mut unchoked = self.peers.values().filter(|p| !p.conn.am_choking).count();
        for peer in self.peers.values_mut() {
            if unchoked >= self.transfer.max_uploads {
                break;
            }
            let conn = &mut peer.conn;
            if conn.state().is_established() && conn.peer_interested && conn.am_choking {
                debug!("Unchoking {}", conn.addr());
                conn.set_choking(false);
                conn.flush(now);
                unchoked += 1;
            }
        }
    }

    fn remove_peer(&mut self, addr: SocketAddr, mux: &mut Multiplexer) {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return;
        };
        mux.deregister(peer.conn.socket_mut(), peer.token);
        let released = self.transfer.pieces.release_peer(&addr);
        self.transfer.pieces.peer_gone(peer.conn.peer_bitfield());
        debug!(
            "Dropped peer {} ({}), released {} blocks",
            addr,
            peer.conn.close_reason().unwrap_or("closed"),
            released
        );
    }

    /// Timeouts, keep-alives, pipeline refill and tracker timers
    pub fn tick(&mut self, mux: &mut Multiplexer, now: Instant) {
        for tracker in &mut self.trackers {
            tracker.tick(now, mux);
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.service_peer(addr, None, mux, now);
        }
    }

    /// Every piece verified
    pub fn is_finished(&self) -> bool {
        self.transfer.pieces.is_complete()
    }

    /// Announce `completed` and stop downloading; uploads continue
    pub fn finish(&mut self, mux: &mut Multiplexer, now: Instant) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("'{}' finished downloading", self.meta.name);
        let progress = self.progress();
        for tracker in &mut self.trackers {
            if tracker.is_exhausted() {
                continue;
            }
            tracker.abort(mux);
            tracker.schedule(AnnounceEvent::Completed, now);
            if let Err(e) = tracker.announce(AnnounceEvent::Completed, progress, now, mux) {
                self.last_tracker_error = Some(e);
            }
        }
        for peer in self.peers.values_mut() {
            peer.conn.set_interested(false);
            peer.conn.flush(now);
        }
    }

    /// Announce `stopped` and drop every connection
    pub fn stop(&mut self, mux: &mut Multiplexer, now: Instant) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let progress = self.progress();
        for tracker in &mut self.trackers {
            if tracker.is_exhausted() {
                continue;
            }
            tracker.abort(mux);
            if let Err(e) = tracker.announce(AnnounceEvent::Stopped, progress, now, mux) {
                debug!("{}", e);
            }
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.conn.close("Torrent stopped");
            }
            self.remove_peer(addr, mux);
        }
        if let Some((mut listener, token)) = self.listener.take() {
            mux.deregister(&mut listener, token);
        }
        self.candidates.clear();
        info!("'{}' stopped", self.meta.name);
    }

    /// Whether any tracker is still usable
    pub fn has_trackers(&self) -> bool {
        self.trackers.iter().any(|t| !t.is_exhausted())
    }

    /// No peers, no candidates and no trackers left to find any
    pub fn is_stalled(&self) -> bool {
        self.peers.is_empty() && self.candidates.is_empty() && !self.has_trackers()
    }

    /// Open connections, including ones still handshaking
    pub fn active_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&mut self, now: Instant) -> TorrentStats {
        let pieces = &self.transfer.pieces;
        let speed = self.transfer.speed.rate(now);
        TorrentStats {
            name: self.meta.name.clone(),
            total_size: self.meta.total_size,
            downloaded: self.transfer.downloaded,
            uploaded: self.transfer.uploaded,
            wasted: pieces.wasted_bytes(),
            hash_misses: pieces.hash_misses(),
            download_speed: speed,
            eta: estimate_eta(pieces.left_bytes(), speed),
            completed_pieces: pieces.completed_pieces(),
            pending_pieces: pieces.pending(),
            total_pieces: pieces.total_pieces(),
            active_peers: self.peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::protocol::{FrameDecoder, Handshake};
    use crate::storage::MemoryStorage;
    use crate::torrent::meta::create_descriptor;

    const PIECE: u32 = 16 * 1024;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn meta_for(data: &[u8], trackers: &[String]) -> TorrentMeta {
        TorrentMeta::from_bytes(&create_descriptor("test.bin", PIECE, data, trackers).unwrap()).unwrap()
    }

    fn config() -> Config {
        Config {
            start_port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_prepare_detects_complete_content() {
        let data = content(3 * PIECE as usize);
        let meta = meta_for(&data, &[]);
        let mut mux = Multiplexer::new().unwrap();
        let now = Instant::now();
        let mut torrent = Torrent::with_backend(meta, Box::new(MemoryStorage::with_data(data)), 0, &config());

        assert_eq!(torrent.prepare(0, true, &mut mux, now), DownloadState::Completed);
        assert!(torrent.is_finished());
        assert_ne!(torrent.port(), 0);
        // state is never overwritten
        assert_eq!(torrent.prepare(0, false, &mut mux, now), DownloadState::Completed);
    }

    #[test]
    fn test_prepare_fresh_download() {
        let data = content(2 * PIECE as usize);
        let meta = meta_for(&data, &["https://tracker.example/announce".to_string()]);
        let mut mux = Multiplexer::new().unwrap();
        let now = Instant::now();
        let mut torrent = Torrent::with_backend(meta, Box::new(MemoryStorage::new(2 * PIECE as u64)), 1, &config());

        assert_eq!(torrent.prepare(0, false, &mut mux, now), DownloadState::None);
        assert!(!torrent.is_finished());
        // https is unsupported, so no tracker remains
        assert!(!torrent.has_trackers());
        assert!(torrent.is_stalled());
        assert!(torrent.next_connection(&mut mux, now));
    }

    #[test]
    fn test_candidates_are_unique() {
        let data = content(PIECE as usize);
        let meta = meta_for(&data, &[]);
        let mut torrent = Torrent::with_backend(meta, Box::new(MemoryStorage::new(PIECE as u64)), 0, &config());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        torrent.add_candidates(vec![addr, addr]);
        torrent.add_candidates(vec![addr]);
        assert_eq!(torrent.candidates.len(), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let data = content(2 * PIECE as usize + 100);
        let meta = meta_for(&data, &[]);
        let mut torrent = Torrent::with_backend(meta, Box::new(MemoryStorage::new(data.len() as u64)), 0, &config());
        let stats = torrent.stats(Instant::now());
        assert_eq!(stats.name, "test.bin");
        assert_eq!(stats.total_pieces, 3);
        assert_eq!(stats.completed_pieces, 0);
        assert_eq!(stats.total_size, data.len() as u64);
        assert_eq!(stats.eta, None);
    }

    #[test]
    fn test_interested_peer_is_unchoked_without_tick() {
        let data = content(2 * PIECE as usize);
        let meta = meta_for(&data, &[]);
        let info_hash = meta.info_hash;
        let mut mux = Multiplexer::new().unwrap();
        let mut torrent = Torrent::with_backend(meta, Box::new(MemoryStorage::with_data(data)), 0, &config());
        assert_eq!(torrent.prepare(0, true, &mut mux, Instant::now()), DownloadState::Completed);

        let mut client = std::net::TcpStream::connect(("127.0.0.1", torrent.port())).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut hello = Handshake::new(info_hash, [9u8; 20]).serialize();
        hello.extend(Message::Interested.serialize());
        client.write_all(&hello).unwrap();

        // only the poll loop runs: the torrent is never ticked
        let mut decoder = FrameDecoder::new();
        let mut greeted = false;
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !seen.contains(&Message::Unchoke) {
            assert!(Instant::now() < deadline, "no unchoke received");
            mux.poll(Duration::from_millis(5), |owner, readiness, mux| {
                torrent.dispatch(owner.endpoint, readiness, mux, Instant::now());
            })
            .unwrap();
            let mut buf = [0u8; 4096];
            match client.read(&mut buf) {
                Ok(0) => panic!("connection closed by the torrent"),
                Ok(n) => decoder.extend(&buf[..n]),
                Err(_) => {}
            }
            if !greeted {
                greeted = decoder.next_handshake().unwrap().is_some();
            }
            if greeted {
                while let Some(message) = decoder.next_message().unwrap() {
                    seen.push(message);
                }
            }
        }
        assert!(matches!(seen[0], Message::Bitfield { .. }));
        assert_eq!(torrent.active_peers(), 1);
    }
}
