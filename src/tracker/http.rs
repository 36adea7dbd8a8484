//! HTTP tracker exchange
//!
//! A plain-HTTP announce run as a non-blocking state machine: connect, write
//! one GET request, read the response until it is complete or the tracker
//! closes the connection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Token};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_bencode::value::Value;
use tracing::{debug, trace};
use url::Url;

use super::{parse_compact_peers, parse_compact_peers6, resolve, AnnounceRequest, AnnounceResult};
use crate::error::{Result, TorrentError};
use crate::net::{Multiplexer, Owner, Readiness};

/// Bytes left unescaped in query values (RFC 3986 unreserved)
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Largest tracker response accepted, headers included
pub const MAX_RESPONSE_LEN: usize = 1024 * 1024;

const USER_AGENT: &str = concat!("torrent-engine/", env!("CARGO_PKG_VERSION"));

/// Host, port and request target of an HTTP tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    /// Path plus any query already present in the announce URL
    pub path: String,
}

impl HttpTarget {
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TorrentError::tracker_failure_with_tracker("Tracker url has no host", url.as_str()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self { host, port, path })
    }

    /// Complete GET request for one announce
    pub fn request(&self, announce: &AnnounceRequest) -> Vec<u8> {
        let separator = if self.path.contains('?') { '&' } else { '?' };
        let host = if self.host.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!(
            "GET {}{}{} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.path,
            separator,
            build_query(announce),
            host,
            self.port,
            USER_AGENT
        )
        .into_bytes()
    }
}

/// Percent-encode raw bytes, leaving the unreserved set as is
pub fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, UNRESERVED).to_string()
}

/// Query string of an announce
pub fn build_query(req: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        encode_bytes(&req.info_hash),
        encode_bytes(&req.peer_id),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left
    );
    if let Some(event) = req.event.as_str() {
        query.push_str("&event=");
        query.push_str(event);
    }
    query
}

/// Status and body of a complete HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Parse `data` as an HTTP/1.x response.
///
/// Returns `None` while more bytes are needed. Without a content-length or
/// chunked encoding the body runs until `eof`.
pub fn parse_http_response(data: &[u8], eof: bool) -> Result<Option<HttpResponse>> {
    let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        if eof {
            return Err(TorrentError::tracker_failure("Truncated HTTP response headers"));
        }
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&data[..header_end]);
    let body = &data[header_end + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(TorrentError::tracker_failure_full("Not an HTTP/1.x response", "unknown", status_line.to_string()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TorrentError::tracker_failure_full("Bad HTTP status line", "unknown", status_line.to_string()))?;

    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == "content-length" {
                content_length = value.parse::<usize>().ok();
            } else if name == "transfer-encoding" && value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
    }

    let body = if chunked {
        match decode_chunked(body)? {
            Some(body) => body,
            None if eof => return Err(TorrentError::tracker_failure("Truncated chunked body")),
            None => return Ok(None),
        }
    } else if let Some(len) = content_length {
        if len > MAX_RESPONSE_LEN {
            return Err(TorrentError::tracker_failure_full(
                "HTTP body too large",
                "unknown",
                format!("{} bytes", len),
            ));
        }
        if body.len() < len {
            if eof {
                return Err(TorrentError::tracker_failure_full(
                    "Truncated HTTP body",
                    "unknown",
                    format!("expected {} bytes, got {}", len, body.len()),
                ));
            }
            return Ok(None);
        }
        body[..len].to_vec()
    } else if eof {
        body.to_vec()
    } else {
        return Ok(None);
    };

    Ok(Some(HttpResponse { status, body }))
}

/// Append received bytes to a pending response, refusing to grow past
/// [`MAX_RESPONSE_LEN`]
fn append_response(response: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if response.len().saturating_add(bytes.len()) > MAX_RESPONSE_LEN {
        return Err(TorrentError::tracker_failure_full(
            "Tracker response too large",
            "unknown",
            format!("more than {} bytes", MAX_RESPONSE_LEN),
        ));
    }
    response.extend_from_slice(bytes);
    Ok(())
}

/// Decode a chunked body; `None` until the terminating chunk arrived
fn decode_chunked(body: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut pos = 0;
    let mut out = Vec::new();
    loop {
        let Some(line_len) = body[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&body[pos..pos + line_len]);
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| TorrentError::tracker_failure_full("Bad chunk size", "unknown", size_field.to_string()))?;
        pos += line_len + 2;
        if size == 0 {
            return Ok(Some(out));
        }
        let end = pos
            .checked_add(size)
            .and_then(|n| n.checked_add(2))
            .filter(|_| out.len().saturating_add(size) <= MAX_RESPONSE_LEN)
            .ok_or_else(|| TorrentError::tracker_failure_full("Chunk too large", "unknown", size_field.to_string()))?;
        if body.len() < end {
            return Ok(None);
        }
        out.extend_from_slice(&body[pos..pos + size]);
        pos += size;
        if &body[pos..pos + 2] != b"\r\n" {
            return Err(TorrentError::tracker_failure("Chunk not terminated by CRLF"));
        }
        pos += 2;
    }
}

fn dict_int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(n)) => Some(*n),
        _ => None,
    }
}

/// Decode the bencoded announce response body
pub fn parse_announce_body(body: &[u8]) -> Result<AnnounceResult> {
    let value: Value = serde_bencode::from_bytes(body)
        .map_err(|e| TorrentError::tracker_failure_full("Undecodable tracker response", "unknown", e.to_string()))?;
    let Value::Dict(dict) = value else {
        return Err(TorrentError::tracker_failure("Tracker response is not a dictionary"));
    };

    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(TorrentError::tracker_failure_full(
            "Tracker refused announce",
            "unknown",
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let mut peers = Vec::new();
    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(bytes)) => peers.extend(parse_compact_peers(bytes)?),
        Some(Value::List(list)) => peers.extend(parse_dict_peers(list)?),
        Some(_) => return Err(TorrentError::tracker_failure("Invalid peers field")),
        None => {}
    }
    match dict.get(b"peers6".as_slice()) {
        Some(Value::Bytes(bytes)) => peers.extend(parse_compact_peers6(bytes)?),
        Some(Value::List(list)) => peers.extend(parse_dict_peers(list)?),
        _ => {}
    }

    let seconds = |key: &[u8]| dict_int(&dict, key).filter(|n| *n > 0).map(|n| n as u64);
    Ok(AnnounceResult {
        peers,
        interval: seconds(b"interval"),
        min_interval: seconds(b"min interval"),
        seeders: dict_int(&dict, b"complete").map(|n| n.max(0) as u32),
        leechers: dict_int(&dict, b"incomplete").map(|n| n.max(0) as u32),
    })
}

fn parse_dict_peers(list: &[Value]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let Value::Dict(dict) = entry else {
            return Err(TorrentError::tracker_failure("Peer entry is not a dictionary"));
        };
        let ip = match dict.get(b"ip".as_slice()) {
            Some(Value::Bytes(ip)) => String::from_utf8_lossy(ip).into_owned(),
            _ => return Err(TorrentError::tracker_failure("Peer entry without ip")),
        };
        let port = dict_int(dict, b"port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| TorrentError::tracker_failure("Peer entry without valid port"))?;
        match ip.parse::<IpAddr>() {
            Ok(ip) => peers.push(SocketAddr::new(ip, port)),
            Err(_) => trace!("Skipping peer with unparsable ip {}", ip),
        }
    }
    Ok(peers)
}

/// One in-flight HTTP announce
#[derive(Debug)]
pub struct HttpExchange {
    stream: TcpStream,
    token: Token,
    request: Vec<u8>,
    written: usize,
    response: Vec<u8>,
    connected: bool,
}

impl HttpExchange {
    /// Resolve the tracker, open a non-blocking connection and register it
    pub fn start(target: &HttpTarget, announce: &AnnounceRequest, owner: Owner, mux: &mut Multiplexer) -> Result<Self> {
        let addr = resolve(&target.host, target.port)?;
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| TorrentError::tracker_failure_full("Connect failed", addr.to_string(), e.to_string()))?;
        let token = mux
            .register(&mut stream, owner, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| TorrentError::tracker_failure_full("Register failed", addr.to_string(), e.to_string()))?;
        debug!("HTTP announce to {}:{}{}", target.host, target.port, target.path);
        Ok(Self {
            stream,
            token,
            request: target.request(announce),
            written: 0,
            response: Vec::new(),
            connected: false,
        })
    }

    /// Advance the exchange; `Some` once the response is complete
    pub fn on_ready(&mut self, readiness: Readiness) -> Result<Option<AnnounceResult>> {
        if !self.connected {
            let pending = self
                .stream
                .take_error()
                .map_err(|e| TorrentError::tracker_failure_full("Connect failed", "unknown", e.to_string()))?;
            if let Some(e) = pending {
                return Err(TorrentError::tracker_failure_full("Connect failed", "unknown", e.to_string()));
            }
            match self.stream.peer_addr() {
                Ok(_) => self.connected = true,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(None),
                Err(e) => return Err(TorrentError::tracker_failure_full("Connect failed", "unknown", e.to_string())),
            }
        }

        while self.written < self.request.len() {
            match self.stream.write(&self.request[self.written..]) {
                Ok(0) => return Err(TorrentError::tracker_failure("Tracker closed during request")),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TorrentError::tracker_failure_full("Write failed", "unknown", e.to_string())),
            }
        }

        if !readiness.readable && !readiness.closed {
            return Ok(None);
        }
        let mut eof = false;
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => append_response(&mut self.response, &chunk[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TorrentError::tracker_failure_full("Read failed", "unknown", e.to_string())),
            }
        }

        let Some(response) = parse_http_response(&self.response, eof)? else {
            return Ok(None);
        };
        if response.status != 200 {
            return Err(TorrentError::tracker_failure_full(
                "Tracker returned HTTP error",
                "unknown",
                format!("status {}", response.status),
            ));
        }
        parse_announce_body(&response.body).map(Some)
    }

    pub fn close(mut self, mux: &mut Multiplexer) {
        mux.deregister(&mut self.stream, self.token);
    }
}
