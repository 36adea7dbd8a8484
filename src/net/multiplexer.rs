//! Connection multiplexer
//!
//! One `mio::Poll` shared by every socket of every torrent. Each registration
//! records which torrent and which endpoint owns the token, so readiness can
//! be routed back without the sockets knowing about each other.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::error::{Result, TorrentError};

/// Index of a torrent within its session
pub type TorrentId = usize;

const EVENT_CAPACITY: usize = 1024;

/// Socket kind within a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Peer(SocketAddr),
    /// Index into the torrent's tracker list
    Tracker(usize),
    Listener,
}

/// Owner of a registered socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    pub torrent: TorrentId,
    pub endpoint: Endpoint,
}

impl Owner {
    pub fn new(torrent: TorrentId, endpoint: Endpoint) -> Self {
        Self { torrent, endpoint }
    }
}

/// Readiness reported for one token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Either half of the connection was closed
    pub closed: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        closed: false,
    };

    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
        closed: false,
    };

    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
        }
    }
}

/// Readiness multiplexer over all sockets of a session
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    owners: HashMap<Token, Owner>,
    next_token: usize,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("registered", &self.owners.len())
            .field("next_token", &self.next_token)
            .finish()
    }
}

impl Multiplexer {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| TorrentError::io_failure_full("Failed to create poll", "poll", e.to_string()))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            owners: HashMap::new(),
            next_token: 0,
        })
    }

    /// Register `source` for `interest`, returning its token
    pub fn register<S: Source + ?Sized>(&mut self, source: &mut S, owner: Owner, interest: Interest) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        self.owners.insert(token, owner);
        trace!("Registered {:?} as {:?}", owner, token);
        Ok(token)
    }

    /// Change the interest of an existing registration
    pub fn reregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a registration; errors are logged, the token is always forgotten
    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) {
        if let Some(owner) = self.owners.remove(&token) {
            trace!("Deregistering {:?} ({:?})", owner, token);
        }
        if let Err(e) = self.poll.registry().deregister(source) {
            warn!("Deregister of {:?} failed: {}", token, e);
        }
    }

    /// Number of live registrations
    pub fn registered(&self) -> usize {
        self.owners.len()
    }

    /// Wait at most `timeout` for readiness and hand every ready socket to `dispatch`.
    ///
    /// `dispatch` may register and deregister sockets; events for tokens
    /// deregistered earlier in the same batch are skipped. Returns the number of
    /// events dispatched.
    pub fn poll<F>(&mut self, timeout: Duration, mut dispatch: F) -> Result<usize>
    where
        F: FnMut(Owner, Readiness, &mut Multiplexer),
    {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => {
                return Err(TorrentError::io_failure_full("Poll failed", "poll", e.to_string()));
            }
        }

        let ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|event| (event.token(), Readiness::from_event(event)))
            .collect();

        let mut dispatched = 0;
        for (token, readiness) in ready {
            let Some(owner) = self.owners.get(&token).copied() else {
                continue;
            };
            dispatch(owner, readiness, self);
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;

    #[test]
    fn test_listener_readiness_routed_to_owner() {
        let mut mux = Multiplexer::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let owner = Owner::new(3, Endpoint::Listener);
        mux.register(&mut listener, owner, Interest::READABLE).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut seen = Vec::new();
        for _ in 0..100 {
            mux.poll(Duration::from_millis(20), |owner, readiness, _| seen.push((owner, readiness)))
                .unwrap();
            if !seen.is_empty() {
                break;
            }
        }
        assert_eq!(seen[0].0, owner);
        assert!(seen[0].1.readable);
    }

    #[test]
    fn test_deregistered_tokens_are_skipped() {
        let mut mux = Multiplexer::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        let peer = Owner::new(0, Endpoint::Peer(addr));
        let token = mux.register(&mut stream, peer, Interest::READABLE | Interest::WRITABLE).unwrap();
        assert_eq!(mux.registered(), 1);

        mux.deregister(&mut stream, token);
        assert_eq!(mux.registered(), 0);

        let (mut accepted, _) = listener.accept().unwrap();
        accepted.write_all(b"x").unwrap();
        let dispatched = mux.poll(Duration::from_millis(50), |_, _, _| {}).unwrap();
        assert_eq!(dispatched, 0);
    }
}
