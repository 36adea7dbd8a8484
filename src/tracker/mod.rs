//! Tracker module
//!
//! Announces to HTTP and UDP trackers without blocking the poll loop. Each
//! tracker runs at most one exchange at a time and backs off on failure.

pub mod http;
pub mod udp;

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Result, TorrentError};
use crate::net::{Multiplexer, Owner, Readiness};

use self::http::{HttpExchange, HttpTarget};
use self::udp::UdpExchange;

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    /// Regular re-announce
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    /// Value of the `event` query parameter
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code of a UDP announce
    pub fn udp_code(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Transfer totals reported with an announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Everything one announce carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// A successful announce response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResult {
    pub peers: Vec<SocketAddr>,
    /// Re-announce interval in seconds
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
}

/// Parse 6-byte compact IPv4 peer entries
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(TorrentError::tracker_failure_full(
            "Compact peer list has wrong length",
            "unknown",
            format!("{} bytes", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be_bytes([c[4], c[5]])))
        })
        .collect())
}

/// Parse 18-byte compact IPv6 peer entries
pub fn parse_compact_peers6(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 18 != 0 {
        return Err(TorrentError::tracker_failure_full(
            "Compact peer6 list has wrong length",
            "unknown",
            format!("{} bytes", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect())
}

/// Resolve a tracker host; briefly blocks on DNS for names
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TorrentError::tracker_failure_full("Cannot resolve tracker", host, e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| TorrentError::tracker_failure_with_tracker("Tracker resolved to no address", host))
}

#[derive(Debug, Clone)]
enum Target {
    Http(HttpTarget),
    Udp { host: String, port: u16 },
}

#[derive(Debug)]
enum Exchange {
    Http(HttpExchange),
    Udp(UdpExchange),
}

impl Exchange {
    fn close(self, mux: &mut Multiplexer) {
        match self {
            Exchange::Http(exchange) => exchange.close(mux),
            Exchange::Udp(exchange) => exchange.close(mux),
        }
    }
}

/// Tracker timing settings taken from the engine config
#[derive(Debug, Clone, Copy)]
struct Limits {
    announce_timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    max_failures: u32,
    default_interval: Duration,
}

/// Announce state of one tracker url
#[derive(Debug)]
pub struct TrackerClient {
    url: String,
    target: Option<Target>,
    owner: Owner,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    limits: Limits,

    exchange: Option<Exchange>,
    exchange_started: Option<Instant>,
    exchange_event: AnnounceEvent,
    outcome: Option<Result<AnnounceResult>>,
    /// Event to send with the next announce
    pending_event: Option<AnnounceEvent>,
    started_acknowledged: bool,

    interval: Duration,
    next_announce_at: Instant,
    backoff: Duration,
    failures: u32,
    exhausted: bool,
    last_peers: HashSet<SocketAddr>,
}

impl TrackerClient {
    /// Client for `url`; unsupported or unparsable urls start out exhausted
    pub fn new(url: &str, owner: Owner, info_hash: [u8; 20], port: u16, config: &Config, now: Instant) -> Self {
        let target = match Url::parse(url) {
            Ok(parsed) => match parsed.scheme() {
                "http" => HttpTarget::from_url(&parsed).ok().map(Target::Http),
                "udp" => match (parsed.host_str(), parsed.port()) {
                    (Some(host), Some(port)) => Some(Target::Udp {
                        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                        port,
                    }),
                    _ => None,
                },
                other => {
                    warn!("Unsupported tracker scheme '{}' in {}", other, url);
                    None
                }
            },
            Err(e) => {
                warn!("Invalid tracker url {}: {}", url, e);
                None
            }
        };
        Self {
            url: url.to_string(),
            exhausted: target.is_none(),
            target,
            owner,
            info_hash,
            peer_id: config.peer_id,
            port,
            limits: Limits {
                announce_timeout: config.announce_timeout,
                backoff_min: config.tracker_backoff_min,
                backoff_max: config.tracker_backoff_max,
                max_failures: config.tracker_max_failures,
                default_interval: config.default_announce_interval,
            },
            exchange: None,
            exchange_started: None,
            exchange_event: AnnounceEvent::None,
            outcome: None,
            pending_event: None,
            started_acknowledged: false,
            interval: config.default_announce_interval,
            next_announce_at: now,
            backoff: config.tracker_backoff_min,
            failures: 0,
            last_peers: HashSet::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Given up after repeated failures or an unusable url
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn in_flight(&self) -> bool {
        self.exchange.is_some()
    }

    /// Whether an announce should be started now
    pub fn is_due(&self, now: Instant) -> bool {
        !self.exhausted && self.exchange.is_none() && now >= self.next_announce_at
    }

    pub fn next_announce_at(&self) -> Instant {
        self.next_announce_at
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Peers returned by the last successful announce
    pub fn last_peers(&self) -> &HashSet<SocketAddr> {
        &self.last_peers
    }

    /// Make the tracker due now with `event`, e.g. `completed`
    pub fn schedule(&mut self, event: AnnounceEvent, now: Instant) {
        self.pending_event = Some(event);
        self.next_announce_at = now;
    }

    /// Start one announce exchange.
    ///
    /// `None` turns into `started` until a `started` announce succeeded.
    /// Refused while another exchange is in flight.
    pub fn announce(
        &mut self,
        event: AnnounceEvent,
        progress: TransferProgress,
        now: Instant,
        mux: &mut Multiplexer,
    ) -> Result<()> {
        if self.exhausted {
            return Err(TorrentError::tracker_failure_with_tracker("Tracker exhausted", self.url.clone()));
        }
        if self.exchange.is_some() {
            return Err(TorrentError::tracker_failure_with_tracker("Announce already in flight", self.url.clone()));
        }
        let Some(target) = self.target.clone() else {
            return Err(TorrentError::tracker_failure_with_tracker("Unsupported tracker", self.url.clone()));
        };

        let mut event = self.pending_event.take().unwrap_or(event);
        if event == AnnounceEvent::None && !self.started_acknowledged {
            event = AnnounceEvent::Started;
        }
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
        };
        debug!("Announcing {:?} to {}", event, self.url);

        let started = match &target {
            Target::Http(http) => HttpExchange::start(http, &request, self.owner, mux).map(Exchange::Http),
            Target::Udp { host, port } => {
                UdpExchange::start(host, *port, request, self.owner, mux, now).map(Exchange::Udp)
            }
        };
        match started {
            Ok(exchange) => {
                self.exchange = Some(exchange);
                self.exchange_started = Some(now);
                self.exchange_event = event;
                Ok(())
            }
            Err(e) => {
                self.exchange_event = event;
                let e = self.attach_url(e);
                self.record_failure(now, &e);
                Err(e)
            }
        }
    }

    fn attach_url(&self, err: TorrentError) -> TorrentError {
        match err {
            TorrentError::TrackerFailure { message, source, .. } => TorrentError::TrackerFailure {
                message,
                tracker: Some(self.url.clone()),
                source,
            },
            other => other,
        }
    }

    /// Route socket readiness to the in-flight exchange
    pub fn on_ready(&mut self, readiness: Readiness, now: Instant, mux: &mut Multiplexer) {
        let progress = match self.exchange.as_mut() {
            Some(Exchange::Http(exchange)) => exchange.on_ready(readiness),
            Some(Exchange::Udp(exchange)) => exchange.on_ready(readiness, now),
            None => return,
        };
        match progress {
            Ok(Some(result)) => self.finish(Ok(result), now, mux),
            Ok(None) => {}
            Err(e) => self.finish(Err(e), now, mux),
        }
    }

    /// Enforce the announce timeout and drive UDP retransmission
    pub fn tick(&mut self, now: Instant, mux: &mut Multiplexer) {
        let Some(started) = self.exchange_started else {
            return;
        };
        if now.saturating_duration_since(started) > self.limits.announce_timeout {
            self.finish(
                Err(TorrentError::tracker_failure_full(
                    "Announce timed out",
                    self.url.clone(),
                    format!("no answer within {:?}", self.limits.announce_timeout),
                )),
                now,
                mux,
            );
            return;
        }
        if let Some(Exchange::Udp(exchange)) = self.exchange.as_mut() {
            if let Err(e) = exchange.tick(now) {
                self.finish(Err(e), now, mux);
            }
        }
    }

    fn finish(&mut self, result: Result<AnnounceResult>, now: Instant, mux: &mut Multiplexer) {
        if let Some(exchange) = self.exchange.take() {
            exchange.close(mux);
        }
        self.exchange_started = None;
        match result {
            Ok(result) => {
                self.started_acknowledged = true;
                self.failures = 0;
                self.backoff = self.limits.backoff_min;
                let secs = result.interval.unwrap_or(self.limits.default_interval.as_secs());
                let secs = secs.max(result.min_interval.unwrap_or(0));
                self.interval = Duration::from_secs(secs);
                self.next_announce_at = now + self.interval;
                self.last_peers = result.peers.iter().copied().collect();
                info!(
                    "Tracker {} returned {} peers (seeders {:?}, leechers {:?}), next announce in {:?}",
                    self.url,
                    result.peers.len(),
                    result.seeders,
                    result.leechers,
                    self.interval
                );
                self.outcome = Some(Ok(result));
            }
            Err(e) => {
                let e = self.attach_url(e);
                self.record_failure(now, &e);
                self.outcome = Some(Err(e));
            }
        }
    }

    fn record_failure(&mut self, now: Instant, err: &TorrentError) {
        // keep the event for the retry unless a newer one was scheduled
        if self.exchange_event != AnnounceEvent::None && self.pending_event.is_none() {
            self.pending_event = Some(self.exchange_event);
        }
        self.failures += 1;
        self.next_announce_at = now + self.backoff;
        warn!("{} (retry in {:?}, failure {})", err, self.backoff, self.failures);
        self.backoff = std::cmp::min(self.backoff * 2, self.limits.backoff_max);
        if self.failures >= self.limits.max_failures {
            warn!("Giving up on tracker {} after {} failures", self.url, self.failures);
            self.exhausted = true;
        }
    }

    /// Take the outcome of the last finished exchange
    pub fn poll(&mut self) -> Option<Result<AnnounceResult>> {
        self.outcome.take()
    }

    /// Drop any in-flight exchange without recording a failure
    pub fn abort(&mut self, mux: &mut Multiplexer) {
        if let Some(exchange) = self.exchange.take() {
            debug!("Aborting announce to {}", self.url);
            exchange.close(mux);
        }
        self.exchange_started = None;
    }
}
