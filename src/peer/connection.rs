//! Peer connection module
//!
//! One peer-wire state machine over one non-blocking socket. The connection
//! never blocks: the multiplexer tells it when the socket is ready and the
//! torrent drives it with `pump`, `tick` and the `send_*` helpers.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Result, TorrentError};
use crate::peer::bitfield::Bitfield;
use crate::peer::state::{ConnectionState, PeerInfo, PeerSource, PeerStats};
use crate::protocol::{FrameDecoder, Handshake, Message};
use crate::storage::BlockRequest;

const READ_CHUNK: usize = 16 * 1024;

/// Upload requests buffered per peer before further ones are dropped
const MAX_UPLOAD_QUEUE: usize = 64;

/// Socket operations the connection needs beyond `Read + Write`
pub trait PeerSocket: Read + Write {
    /// `Ok(true)` once a non-blocking connect has completed
    fn poll_connected(&mut self) -> io::Result<bool>;
}

impl PeerSocket for mio::net::TcpStream {
    fn poll_connected(&mut self) -> io::Result<bool> {
        if let Some(e) = self.take_error()? {
            return Err(e);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Timing limits of a connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub peer_timeout: Duration,
}

impl From<&Config> for ConnectionLimits {
    fn from(config: &Config) -> Self {
        Self {
            pipeline_depth: config.pipeline_depth,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            keep_alive_interval: config.keep_alive_interval,
            peer_timeout: config.peer_timeout,
        }
    }
}

/// One peer-wire protocol state machine
#[derive(Debug)]
pub struct PeerConnection<S = mio::net::TcpStream> {
    pub info: PeerInfo,
    socket: S,
    state: ConnectionState,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    limits: ConnectionLimits,

    peer_bitfield: Bitfield,
    bitfield_allowed: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// Requests sent and not yet answered, oldest first
    outstanding: VecDeque<BlockRequest>,
    /// Requests accepted but not yet written
    queued: VecDeque<BlockRequest>,
    /// Blocks the peer asked us for, as (index, begin, length)
    uploads: VecDeque<(u32, u32, u32)>,

    decoder: FrameDecoder,
    write_buf: BytesMut,
    handshake_sent: bool,
    was_established: bool,
    close_reason: Option<String>,

    state_since: Instant,
    last_activity: Instant,
    last_sent: Instant,
    stats: PeerStats,
}

impl<S: PeerSocket> PeerConnection<S> {
    /// Outbound connection whose TCP connect is still in progress
    pub fn outbound(
        socket: S,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        limits: ConnectionLimits,
        now: Instant,
    ) -> Self {
        debug!("Connecting to peer {}", addr);
        Self::new(socket, PeerInfo::new(addr, PeerSource::Tracker), info_hash, our_peer_id, num_pieces, limits, now)
    }

    /// Accepted connection; our handshake is queued immediately
    pub fn inbound(
        socket: S,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        limits: ConnectionLimits,
        now: Instant,
    ) -> Self {
        debug!("Accepted peer {}", addr);
        let mut conn =
            Self::new(socket, PeerInfo::new(addr, PeerSource::Incoming), info_hash, our_peer_id, num_pieces, limits, now);
        conn.set_state(ConnectionState::Handshaking, now);
        conn.send_handshake();
        conn
    }

    fn new(
        socket: S,
        info: PeerInfo,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        limits: ConnectionLimits,
        now: Instant,
    ) -> Self {
        Self {
            info,
            socket,
            state: ConnectionState::Connecting,
            info_hash,
            our_peer_id,
            limits,
            peer_bitfield: Bitfield::new(num_pieces),
            bitfield_allowed: true,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: VecDeque::new(),
            queued: VecDeque::new(),
            uploads: VecDeque::new(),
            decoder: FrameDecoder::new(),
            write_buf: BytesMut::new(),
            handshake_sent: false,
            was_established: false,
            close_reason: None,
            state_since: now,
            last_activity: now,
            last_sent: now,
            stats: PeerStats::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection ever reached `Established`
    pub fn was_established(&self) -> bool {
        self.was_established
    }

    pub fn peer_bitfield(&self) -> &Bitfield {
        &self.peer_bitfield
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Underlying socket, for multiplexer (de)registration
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Requests sent and awaiting a `piece`
    pub fn outstanding(&self) -> impl Iterator<Item = &BlockRequest> {
        self.outstanding.iter()
    }

    /// Requests in flight or queued
    pub fn requests_in_flight(&self) -> usize {
        self.outstanding.len() + self.queued.len()
    }

    /// Whether another request fits in the pipeline
    pub fn can_request(&self) -> bool {
        self.state.is_established() && !self.peer_choking && self.requests_in_flight() < self.limits.pipeline_depth
    }

    /// Whether unsent bytes are buffered
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    fn set_state(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            trace!("Peer {} {:?} -> {:?}", self.info.addr, self.state, state);
            self.state = state;
            self.state_since = now;
            if state == ConnectionState::Established {
                self.was_established = true;
            }
        }
    }

    /// Move to `Closing`, dropping all request state
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.state.is_closing() {
            return;
        }
        let reason = reason.into();
        debug!("Closing peer {}: {}", self.info.addr, reason);
        self.state = ConnectionState::Closing;
        self.close_reason = Some(reason);
        self.outstanding.clear();
        self.queued.clear();
        self.uploads.clear();
    }

    fn fail(&mut self, err: TorrentError) -> TorrentError {
        let err = err.with_peer(self.info.addr.to_string());
        self.close(err.to_string());
        err
    }

    /// Queue our handshake
    pub fn send_handshake(&mut self) {
        if self.handshake_sent {
            return;
        }
        let handshake = Handshake::new(self.info_hash, self.our_peer_id);
        self.write_buf.extend_from_slice(&handshake.serialize());
        self.handshake_sent = true;
    }

    /// Queue one message
    pub fn send(&mut self, message: &Message) {
        if self.state.is_closing() {
            return;
        }
        trace!("Queueing {:?} for {}", message.message_id(), self.info.addr);
        self.write_buf.extend_from_slice(&message.serialize());
    }

    /// Queue our bitfield if we hold anything
    pub fn send_bitfield(&mut self, bitfield: &Bitfield) {
        if !bitfield.is_empty() {
            self.send(&Message::Bitfield { bitfield: bitfield.as_bytes().to_vec() });
        }
    }

    /// Update our interest, sending the change
    pub fn set_interested(&mut self, interested: bool) {
        if self.am_interested != interested {
            self.am_interested = interested;
            self.send(if interested { &Message::Interested } else { &Message::NotInterested });
        }
    }

    /// Update our choke state, sending the change
    pub fn set_choking(&mut self, choking: bool) {
        if self.am_choking != choking {
            self.am_choking = choking;
            if choking {
                self.uploads.clear();
            }
            self.send(if choking { &Message::Choke } else { &Message::Unchoke });
        }
    }

    /// Queue a block for upload
    pub fn send_block(&mut self, index: u32, begin: u32, block: Vec<u8>) {
        self.stats.uploaded += block.len() as u64;
        self.send(&Message::Piece { index, begin, block });
    }

    /// Next block the peer asked for and did not cancel
    pub fn next_upload(&mut self) -> Option<(u32, u32, u32)> {
        self.uploads.pop_front()
    }

    /// Accept a request into the pipeline.
    ///
    /// Refused while the peer chokes us, before the handshake completes, or
    /// when the pipeline is full.
    pub fn queue_request(&mut self, request: BlockRequest) -> bool {
        if !self.can_request() {
            return false;
        }
        self.queued.push_back(request);
        true
    }

    /// Turn queued requests into `request` messages
    pub fn flush_requests(&mut self) {
        while let Some(req) = self.queued.pop_front() {
            self.send(&Message::Request {
                index: req.piece,
                begin: req.begin,
                length: req.length,
            });
            self.outstanding.push_back(req);
        }
    }

    /// Feed received bytes through the decoder.
    ///
    /// Returns the decoded messages in order; partial input stays buffered.
    /// Any violation moves the connection to `Closing`.
    pub fn pump(&mut self, bytes: &[u8], now: Instant) -> Result<Vec<Message>> {
        if self.state.is_closing() {
            return Ok(Vec::new());
        }
        if !bytes.is_empty() {
            self.last_activity = now;
            self.stats.bytes_read += bytes.len() as u64;
        }
        self.decoder.extend(bytes);

        let mut messages = Vec::new();
        if self.state == ConnectionState::Handshaking || self.state == ConnectionState::Connecting {
            let handshake = match self.decoder.next_handshake() {
                Ok(Some(handshake)) => handshake,
                Ok(None) => return Ok(messages),
                Err(e) => return Err(self.fail(e)),
            };
            if !handshake.validate(&self.info_hash) {
                return Err(self.fail(TorrentError::protocol_violation_with_source(
                    "Handshake info hash mismatch",
                    hex::encode(handshake.info_hash),
                )));
            }
            if handshake.peer_id == self.our_peer_id {
                return Err(self.fail(TorrentError::protocol_violation("Connected to ourselves")));
            }
            self.info.peer_id = Some(handshake.peer_id);
            self.send_handshake();
            self.set_state(ConnectionState::Established, now);
            debug!("Handshake complete with {}", self.info.addr);
        }

        loop {
            let message = match self.decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            match self.apply(&message) {
                Ok(true) => messages.push(message),
                Ok(false) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(messages)
    }

    /// Apply a message to connection state; `false` means it had no effect
    fn apply(&mut self, message: &Message) -> Result<bool> {
        if !matches!(message, Message::KeepAlive | Message::Bitfield { .. }) {
            self.bitfield_allowed = false;
        }
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                if !self.queued.is_empty() || !self.outstanding.is_empty() {
                    debug!(
                        "Choked by {}, dropping {} queued and {} outstanding requests",
                        self.info.addr,
                        self.queued.len(),
                        self.outstanding.len()
                    );
                }
                self.queued.clear();
                self.outstanding.clear();
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                if *piece_index as usize >= self.peer_bitfield.len() {
                    return Err(TorrentError::protocol_violation_with_source(
                        "Have for unknown piece",
                        format!("piece {}", piece_index),
                    ));
                }
                return Ok(self.peer_bitfield.set(*piece_index as usize));
            }
            Message::Bitfield { bitfield } => {
                if !self.bitfield_allowed {
                    return Err(TorrentError::protocol_violation("Bitfield after other messages"));
                }
                self.bitfield_allowed = false;
                self.peer_bitfield = Bitfield::from_bytes(bitfield, self.peer_bitfield.len())?;
            }
            Message::Request { index, begin, length } => {
                if self.am_choking {
                    trace!("Ignoring request from choked peer {}", self.info.addr);
                    return Ok(false);
                }
                if self.uploads.len() >= MAX_UPLOAD_QUEUE {
                    warn!("Upload queue of {} full, dropping request", self.info.addr);
                    return Ok(false);
                }
                self.uploads.push_back((*index, *begin, *length));
            }
            Message::Cancel { index, begin, length } => {
                self.uploads.retain(|r| *r != (*index, *begin, *length));
            }
            Message::Port { .. } => {}
            Message::Piece { index, begin, block } => {
                self.stats.downloaded += block.len() as u64;
                if let Some(pos) = self
                    .outstanding
                    .iter()
                    .position(|r| r.piece == *index && r.begin == *begin && r.length as usize == block.len())
                {
                    self.outstanding.remove(pos);
                } else {
                    trace!("Unrequested block {}:{} from {}", index, begin, self.info.addr);
                }
            }
        }
        Ok(true)
    }

    /// Drain the socket and decode what arrived.
    ///
    /// EOF and socket errors close the connection without an error; only
    /// protocol violations are returned as `Err`. Messages decoded before an
    /// EOF are still returned.
    pub fn on_readable(&mut self, now: Instant) -> Result<Vec<Message>> {
        let mut received = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    // messages that arrived with the FIN still count
                    let messages = self.pump(&received, now)?;
                    self.close("Connection closed by peer");
                    return Ok(messages);
                }
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(format!("Read failed: {}", e));
                    return Ok(Vec::new());
                }
            }
        }
        self.pump(&received, now)
    }

    /// Complete a pending connect and flush buffered output
    pub fn on_writable(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            match self.socket.poll_connected() {
                Ok(true) => {
                    debug!("Connected to {}", self.info.addr);
                    self.set_state(ConnectionState::Handshaking, now);
                    self.send_handshake();
                }
                Ok(false) => return,
                Err(e) => {
                    self.close(format!("Connect failed: {}", e));
                    return;
                }
            }
        }
        self.flush(now);
    }

    /// Write as much buffered output as the socket accepts
    pub fn flush(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            return;
        }
        while !self.write_buf.is_empty() && !self.state.is_closing() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => {
                    self.close("Socket refused writes");
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                    self.stats.bytes_written += n as u64;
                    self.last_sent = now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(format!("Write failed: {}", e));
                }
            }
        }
    }

    /// Enforce timeouts and emit keep-alives
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        let in_state = now.saturating_duration_since(self.state_since);
        match self.state {
            ConnectionState::Connecting if in_state > self.limits.connect_timeout => {
                return Err(self.fail(TorrentError::protocol_violation("Connect timed out")));
            }
            ConnectionState::Handshaking if in_state > self.limits.handshake_timeout => {
                return Err(self.fail(TorrentError::protocol_violation("Handshake timed out")));
            }
            ConnectionState::Established => {
                if now.saturating_duration_since(self.last_activity) > self.limits.peer_timeout {
                    warn!("Peer {} silent for {:?}", self.info.addr, self.limits.peer_timeout);
                    return Err(self.fail(TorrentError::protocol_violation("Keep-alive timeout")));
                }
                if self.write_buf.is_empty()
                    && now.saturating_duration_since(self.last_sent) >= self.limits.keep_alive_interval
                {
                    self.send(&Message::KeepAlive);
                    self.last_sent = now;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory socket: reads drain `input`, writes append to `output`
    #[derive(Debug, Default)]
    pub(crate) struct MockSocket {
        pub input: VecDeque<u8>,
        pub output: Vec<u8>,
        pub connected: bool,
        pub eof: bool,
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = std::cmp::min(buf.len(), self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl PeerSocket for MockSocket {
        fn poll_connected(&mut self) -> io::Result<bool> {
            Ok(self.connected)
        }
    }

    const INFO_HASH: [u8; 20] = [7u8; 20];
    const OUR_ID: [u8; 20] = [1u8; 20];
    const THEIR_ID: [u8; 20] = [2u8; 20];

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            pipeline_depth: 2,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(180),
        }
    }

    fn addr() -> SocketAddr {
        "10.1.1.1:6881".parse().unwrap()
    }

    fn established(now: Instant) -> PeerConnection<MockSocket> {
        let mut conn = PeerConnection::inbound(MockSocket::default(), addr(), INFO_HASH, OUR_ID, 16, limits(), now);
        conn.pump(&Handshake::new(INFO_HASH, THEIR_ID).serialize(), now).unwrap();
        assert!(conn.state().is_established());
        conn
    }

    fn request(piece: u32, begin: u32) -> BlockRequest {
        BlockRequest { piece, block: (begin / 16384) as usize, begin, length: 16384 }
    }

    #[test]
    fn test_outbound_handshake_flow() {
        let now = Instant::now();
        let mut conn = PeerConnection::outbound(MockSocket::default(), addr(), INFO_HASH, OUR_ID, 16, limits(), now);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.on_writable(now);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.socket_mut().connected = true;
        conn.on_writable(now);
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert_eq!(conn.socket_mut().output, Handshake::new(INFO_HASH, OUR_ID).serialize());

        let mut bytes = Handshake::new(INFO_HASH, THEIR_ID).serialize();
        bytes.extend(Message::Unchoke.serialize());
        let messages = conn.pump(&bytes, now).unwrap();
        assert!(conn.state().is_established());
        assert_eq!(messages, vec![Message::Unchoke]);
        assert_eq!(conn.info.peer_id, Some(THEIR_ID));
        assert!(!conn.peer_choking);
    }

    #[test]
    fn test_info_hash_mismatch_closes_without_establishing() {
        let now = Instant::now();
        let mut conn = PeerConnection::inbound(MockSocket::default(), addr(), INFO_HASH, OUR_ID, 16, limits(), now);
        let err = conn.pump(&Handshake::new([9u8; 20], THEIR_ID).serialize(), now).unwrap_err();

        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.was_established());
    }

    #[test]
    fn test_partial_messages_are_buffered() {
        let now = Instant::now();
        let mut conn = established(now);
        let bytes = Message::Have { piece_index: 5 }.serialize();

        assert!(conn.pump(&bytes[..3], now).unwrap().is_empty());
        let messages = conn.pump(&bytes[3..], now).unwrap();
        assert_eq!(messages, vec![Message::Have { piece_index: 5 }]);
        assert!(conn.peer_bitfield().has(5));
    }

    #[test]
    fn test_duplicate_have_is_idempotent() {
        let now = Instant::now();
        let mut conn = established(now);
        let have = Message::Have { piece_index: 3 }.serialize();

        assert_eq!(conn.pump(&have, now).unwrap().len(), 1);
        assert!(conn.pump(&have, now).unwrap().is_empty());
        assert_eq!(conn.peer_bitfield().count(), 1);
    }

    #[test]
    fn test_have_out_of_range_is_violation() {
        let now = Instant::now();
        let mut conn = established(now);
        let err = conn.pump(&Message::Have { piece_index: 16 }.serialize(), now).unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
        assert!(conn.state().is_closing());
    }

    #[test]
    fn test_oversized_message_closes() {
        let now = Instant::now();
        let mut conn = established(now);
        let err = conn.pump(&[0x10, 0, 0, 0, 7], now).unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
        assert!(conn.state().is_closing());
    }

    #[test]
    fn test_requests_refused_while_choked() {
        let now = Instant::now();
        let mut conn = established(now);
        assert!(!conn.queue_request(request(0, 0)));

        conn.pump(&Message::Unchoke.serialize(), now).unwrap();
        assert!(conn.queue_request(request(0, 0)));
        assert!(conn.queue_request(request(0, 16384)));
        assert!(!conn.queue_request(request(0, 32768)));
    }

    #[test]
    fn test_choke_drops_queued_requests() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.pump(&Message::Unchoke.serialize(), now).unwrap();
        conn.queue_request(request(1, 0));
        conn.queue_request(request(1, 16384));
        conn.flush(now);
        conn.socket_mut().output.clear();

        conn.pump(&Message::Choke.serialize(), now).unwrap();
        conn.flush_requests();
        conn.flush(now);

        assert_eq!(conn.requests_in_flight(), 0);
        assert!(conn.socket_mut().output.is_empty());
    }

    #[test]
    fn test_piece_clears_outstanding_request() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.pump(&Message::Unchoke.serialize(), now).unwrap();
        conn.queue_request(request(2, 0));
        conn.flush_requests();
        assert_eq!(conn.outstanding().count(), 1);

        let piece = Message::Piece { index: 2, begin: 0, block: vec![0; 16384] }.serialize();
        let messages = conn.pump(&piece, now).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(conn.outstanding().count(), 0);
        assert_eq!(conn.stats().downloaded, 16384);
    }

    #[test]
    fn test_cancel_removes_queued_upload() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.pump(&Message::Request { index: 0, begin: 0, length: 16384 }.serialize(), now).unwrap();
        assert!(conn.next_upload().is_none());

        conn.set_choking(false);
        let mut bytes = Message::Request { index: 0, begin: 0, length: 16384 }.serialize();
        bytes.extend(Message::Request { index: 1, begin: 0, length: 16384 }.serialize());
        bytes.extend(Message::Cancel { index: 0, begin: 0, length: 16384 }.serialize());
        conn.pump(&bytes, now).unwrap();

        assert_eq!(conn.next_upload(), Some((1, 0, 16384)));
        assert!(conn.next_upload().is_none());
    }

    #[test]
    fn test_bitfield_after_have_is_violation() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.pump(&Message::Have { piece_index: 0 }.serialize(), now).unwrap();
        let bytes = Message::Bitfield { bitfield: vec![0xff, 0xff] }.serialize();
        assert!(conn.pump(&bytes, now).is_err());
    }

    #[test]
    fn test_keep_alive_timeout_closes() {
        let now = Instant::now();
        let mut conn = established(now);
        assert!(conn.tick(now + Duration::from_secs(60)).is_ok());
        assert!(conn.tick(now + Duration::from_secs(181)).is_err());
        assert!(conn.state().is_closing());
    }

    #[test]
    fn test_keep_alive_sent_when_idle() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.flush(now);
        conn.socket_mut().output.clear();

        conn.tick(now + Duration::from_secs(121)).unwrap();
        conn.flush(now + Duration::from_secs(121));
        assert_eq!(conn.socket_mut().output, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let mut conn = PeerConnection::inbound(MockSocket::default(), addr(), INFO_HASH, OUR_ID, 16, limits(), now);
        assert!(conn.tick(now + Duration::from_secs(21)).is_err());
        assert!(!conn.was_established());
    }

    #[test]
    fn test_on_readable_eof_closes() {
        let now = Instant::now();
        let mut conn = established(now);
        conn.socket_mut().eof = true;
        assert!(conn.on_readable(now).unwrap().is_empty());
        assert!(conn.state().is_closing());
    }

    #[test]
    fn test_piece_before_eof_is_delivered() {
        let now = Instant::now();
        let mut conn = established(now);
        let piece = Message::Piece { index: 3, begin: 0, block: vec![5u8; 64] };
        conn.socket_mut().input.extend(piece.serialize());
        conn.socket_mut().eof = true;

        let messages = conn.on_readable(now).unwrap();
        assert_eq!(messages, vec![piece]);
        assert!(conn.state().is_closing());
        assert_eq!(conn.close_reason(), Some("Connection closed by peer"));
    }
}
