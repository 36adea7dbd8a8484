//! UDP tracker exchange (BEP 15)
//!
//! connect, then announce, over one non-blocking datagram socket. Lost
//! datagrams are retransmitted after `15 * 2^n` seconds.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Token};
use tracing::{debug, trace};

use super::{parse_compact_peers, parse_compact_peers6, resolve, AnnounceRequest, AnnounceResult};
use crate::error::{Result, TorrentError};
use crate::net::{Multiplexer, Owner, Readiness};

/// Magic connection id of the connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

/// Size of an announce request
pub const ANNOUNCE_LEN: usize = 98;

const ANNOUNCE_HEADER_LEN: usize = 20;
const RETRANSMIT_BASE: Duration = Duration::from_secs(15);
const MAX_RETRANSMITS: u32 = 8;
const MAX_DATAGRAM: usize = 2048;

/// Retransmission delay after `attempt` unanswered sends
pub fn retransmit_timeout(attempt: u32) -> Duration {
    RETRANSMIT_BASE * 2u32.pow(attempt.min(MAX_RETRANSMITS))
}

pub fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf
}

pub fn build_announce_request(connection_id: u64, transaction_id: u32, req: &AnnounceRequest, key: u32) -> [u8; ANNOUNCE_LEN] {
    let mut buf = [0u8; ANNOUNCE_LEN];
    buf[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf[16..36].copy_from_slice(&req.info_hash);
    buf[36..56].copy_from_slice(&req.peer_id);
    buf[56..64].copy_from_slice(&req.downloaded.to_be_bytes());
    buf[64..72].copy_from_slice(&req.left.to_be_bytes());
    buf[72..80].copy_from_slice(&req.uploaded.to_be_bytes());
    buf[80..84].copy_from_slice(&req.event.udp_code().to_be_bytes());
    // ip 0: the tracker uses the source address
    buf[84..88].copy_from_slice(&0u32.to_be_bytes());
    buf[88..92].copy_from_slice(&key.to_be_bytes());
    buf[92..96].copy_from_slice(&(-1i32).to_be_bytes());
    buf[96..98].copy_from_slice(&req.port.to_be_bytes());
    buf
}

/// A decoded tracker datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpResponse {
    Connect { transaction_id: u32, connection_id: u64 },
    Announce { transaction_id: u32, result: AnnounceResult },
    Error { transaction_id: u32, message: String },
}

impl UdpResponse {
    pub fn transaction_id(&self) -> u32 {
        match self {
            UdpResponse::Connect { transaction_id, .. }
            | UdpResponse::Announce { transaction_id, .. }
            | UdpResponse::Error { transaction_id, .. } => *transaction_id,
        }
    }
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decode a datagram; peers are 18-byte entries when `ipv6`
pub fn parse_response(buf: &[u8], ipv6: bool) -> Result<UdpResponse> {
    if buf.len() < 8 {
        return Err(TorrentError::tracker_failure_full(
            "Tracker datagram too short",
            "udp",
            format!("{} bytes", buf.len()),
        ));
    }
    let action = be_u32(buf, 0);
    let transaction_id = be_u32(buf, 4);
    match action {
        ACTION_CONNECT => {
            if buf.len() < 16 {
                return Err(TorrentError::tracker_failure("Connect response too short"));
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&buf[8..16]);
            Ok(UdpResponse::Connect {
                transaction_id,
                connection_id: u64::from_be_bytes(id),
            })
        }
        ACTION_ANNOUNCE => {
            if buf.len() < ANNOUNCE_HEADER_LEN {
                return Err(TorrentError::tracker_failure("Announce response too short"));
            }
            let entries = &buf[ANNOUNCE_HEADER_LEN..];
            let peers = if ipv6 {
                parse_compact_peers6(&entries[..entries.len() - entries.len() % 18])?
            } else {
                parse_compact_peers(&entries[..entries.len() - entries.len() % 6])?
            };
            Ok(UdpResponse::Announce {
                transaction_id,
                result: AnnounceResult {
                    peers,
                    interval: Some(be_u32(buf, 8) as u64).filter(|i| *i > 0),
                    min_interval: None,
                    leechers: Some(be_u32(buf, 12)),
                    seeders: Some(be_u32(buf, 16)),
                },
            })
        }
        ACTION_ERROR => Ok(UdpResponse::Error {
            transaction_id,
            message: String::from_utf8_lossy(&buf[8..]).into_owned(),
        }),
        other => Err(TorrentError::tracker_failure_full("Unknown tracker action", "udp", format!("action {}", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    Announce { connection_id: u64 },
}

/// One in-flight UDP announce
#[derive(Debug)]
pub struct UdpExchange {
    socket: UdpSocket,
    token: Token,
    remote: SocketAddr,
    request: AnnounceRequest,
    key: u32,
    stage: Stage,
    transaction_id: u32,
    attempt: u32,
    /// When the current datagram went out; `None` while waiting to send
    sent_at: Option<Instant>,
}

impl UdpExchange {
    /// Resolve the tracker, bind a socket and send the connect request
    pub fn start(
        host: &str,
        port: u16,
        request: AnnounceRequest,
        owner: Owner,
        mux: &mut Multiplexer,
        now: Instant,
    ) -> Result<Self> {
        let remote = resolve(host, port)?;
        let local: SocketAddr = if remote.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let failed = |what: &str, e: io::Error| TorrentError::tracker_failure_full(what.to_string(), remote.to_string(), e.to_string());
        let mut socket = UdpSocket::bind(local).map_err(|e| failed("Bind failed", e))?;
        socket.connect(remote).map_err(|e| failed("Connect failed", e))?;
        let token = mux
            .register(&mut socket, owner, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| failed("Register failed", e))?;

        debug!("UDP announce to {}", remote);
        let mut exchange = Self {
            socket,
            token,
            remote,
            request,
            key: rand::random(),
            stage: Stage::Connect,
            transaction_id: 0,
            attempt: 0,
            sent_at: None,
        };
        exchange.send(now)?;
        Ok(exchange)
    }

    fn packet(&self) -> Vec<u8> {
        match self.stage {
            Stage::Connect => build_connect_request(self.transaction_id).to_vec(),
            Stage::Announce { connection_id } => {
                build_announce_request(connection_id, self.transaction_id, &self.request, self.key).to_vec()
            }
        }
    }

    fn send(&mut self, now: Instant) -> Result<()> {
        self.transaction_id = rand::random();
        match self.socket.send(&self.packet()) {
            Ok(_) => {
                trace!("Sent {:?} to {} (attempt {})", self.stage, self.remote, self.attempt);
                self.sent_at = Some(now);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.sent_at = None;
                Ok(())
            }
            Err(e) => Err(TorrentError::tracker_failure_full("Send failed", self.remote.to_string(), e.to_string())),
        }
    }

    /// Advance the exchange; `Some` once the announce response arrived
    pub fn on_ready(&mut self, readiness: Readiness, now: Instant) -> Result<Option<AnnounceResult>> {
        if readiness.writable && self.sent_at.is_none() {
            self.send(now)?;
        }
        if !readiness.readable {
            return Ok(None);
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TorrentError::tracker_failure_full("Receive failed", self.remote.to_string(), e.to_string()))
                }
            };
            let response = parse_response(&buf[..n], self.remote.is_ipv6())?;
            if response.transaction_id() != self.transaction_id {
                trace!("Ignoring datagram with stale transaction id from {}", self.remote);
                continue;
            }
            match (self.stage, response) {
                (_, UdpResponse::Error { message, .. }) => {
                    return Err(TorrentError::tracker_failure_full("Tracker error", self.remote.to_string(), message));
                }
                (Stage::Connect, UdpResponse::Connect { connection_id, .. }) => {
                    self.stage = Stage::Announce { connection_id };
                    self.attempt = 0;
                    self.send(now)?;
                }
                (Stage::Announce { .. }, UdpResponse::Announce { result, .. }) => return Ok(Some(result)),
                (stage, other) => {
                    trace!("Unexpected {:?} during {:?}", other, stage);
                }
            }
        }
    }

    /// Retransmit once the current datagram has gone unanswered too long
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        let Some(sent_at) = self.sent_at else {
            return Ok(());
        };
        if now.saturating_duration_since(sent_at) >= retransmit_timeout(self.attempt) {
            self.attempt += 1;
            debug!("Retransmitting to {} (attempt {})", self.remote, self.attempt);
            self.send(now)?;
        }
        Ok(())
    }

    pub fn close(mut self, mux: &mut Multiplexer) {
        mux.deregister(&mut self.socket, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xaa; 20],
            peer_id: [0xbb; 20],
            port: 6881,
            uploaded: 3,
            downloaded: 2,
            left: 1,
            event: AnnounceEvent::Started,
        }
    }

    #[test]
    fn test_connect_request_layout() {
        let buf = build_connect_request(0xdeadbeef);
        assert_eq!(&buf[0..8], &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_announce_request_layout() {
        let buf = build_announce_request(0x0102030405060708, 7, &request(), 0x11223344);
        assert_eq!(buf.len(), 98);
        assert_eq!(&buf[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 7]);
        assert_eq!(&buf[16..36], &[0xaa; 20]);
        assert_eq!(&buf[36..56], &[0xbb; 20]);
        assert_eq!(u64::from_be_bytes(buf[56..64].try_into().unwrap()), 2);
        assert_eq!(u64::from_be_bytes(buf[64..72].try_into().unwrap()), 1);
        assert_eq!(u64::from_be_bytes(buf[72..80].try_into().unwrap()), 3);
        assert_eq!(&buf[80..84], &[0, 0, 0, 2]);
        assert_eq!(&buf[84..88], &[0, 0, 0, 0]);
        assert_eq!(&buf[88..92], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&buf[92..96], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&buf[96..98], &[0x1a, 0xe1]);
    }

    #[test]
    fn test_parse_connect_response() {
        let mut buf = vec![0, 0, 0, 0, 0, 0, 0, 9];
        buf.extend_from_slice(&42u64.to_be_bytes());
        assert_eq!(
            parse_response(&buf, false).unwrap(),
            UdpResponse::Connect { transaction_id: 9, connection_id: 42 }
        );
    }

    #[test]
    fn test_parse_announce_response() {
        let mut buf = vec![0, 0, 0, 1, 0, 0, 0, 5];
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&6u32.to_be_bytes());
        buf.extend_from_slice(&[192, 168, 1, 2, 0x1a, 0xe1]);

        match parse_response(&buf, false).unwrap() {
            UdpResponse::Announce { transaction_id, result } => {
                assert_eq!(transaction_id, 5);
                assert_eq!(result.interval, Some(1800));
                assert_eq!(result.leechers, Some(4));
                assert_eq!(result.seeders, Some(6));
                assert_eq!(result.peers, vec!["192.168.1.2:6881".parse().unwrap()]);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let mut buf = vec![0, 0, 0, 3, 0, 0, 0, 1];
        buf.extend_from_slice(b"torrent not registered");
        assert_eq!(
            parse_response(&buf, false).unwrap(),
            UdpResponse::Error { transaction_id: 1, message: "torrent not registered".to_string() }
        );
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(parse_response(&[0, 0, 0], false).is_err());
        assert!(parse_response(&[0, 0, 0, 1, 0, 0, 0, 1, 0], false).is_err());
    }

    #[test]
    fn test_retransmit_timeout_doubles() {
        assert_eq!(retransmit_timeout(0), Duration::from_secs(15));
        assert_eq!(retransmit_timeout(1), Duration::from_secs(30));
        assert_eq!(retransmit_timeout(3), Duration::from_secs(120));
        assert_eq!(retransmit_timeout(20), retransmit_timeout(MAX_RETRANSMITS));
    }

    #[test]
    fn test_exchange_against_loopback_tracker() {
        let tracker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = tracker.local_addr().unwrap().port();
        tracker.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut mux = Multiplexer::new().unwrap();
        let owner = Owner::new(0, crate::net::Endpoint::Tracker(0));
        let now = Instant::now();
        let mut exchange = UdpExchange::start("127.0.0.1", port, request(), owner, &mut mux, now).unwrap();

        let mut buf = [0u8; 128];
        let (n, client) = tracker.recv_from(&mut buf).unwrap();
        assert_eq!(n, 16);
        let mut reply = vec![0, 0, 0, 0];
        reply.extend_from_slice(&buf[12..16]);
        reply.extend_from_slice(&77u64.to_be_bytes());
        tracker.send_to(&reply, client).unwrap();
        tracker.set_read_timeout(Some(Duration::from_millis(10))).unwrap();

        let mut result = None;
        let mut answered = false;
        for _ in 0..200 {
            let mut ready = Vec::new();
            mux.poll(Duration::from_millis(10), |_, readiness, _| ready.push(readiness)).unwrap();
            for readiness in ready {
                if let Some(r) = exchange.on_ready(readiness, now).unwrap() {
                    result = Some(r);
                }
            }
            if result.is_some() {
                break;
            }
            if !answered {
                if let Ok((n, client)) = tracker.recv_from(&mut buf) {
                    assert_eq!(n, ANNOUNCE_LEN);
                    assert_eq!(&buf[0..8], &77u64.to_be_bytes());
                    let mut reply = vec![0, 0, 0, 1];
                    reply.extend_from_slice(&buf[12..16]);
                    reply.extend_from_slice(&60u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
                    tracker.send_to(&reply, client).unwrap();
                    answered = true;
                }
            }
        }

        let result = result.unwrap();
        assert_eq!(result.interval, Some(60));
        assert_eq!(result.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
        exchange.close(&mut mux);
    }
}
