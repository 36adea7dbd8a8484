//! Error types for the torrent engine
//!
//! Every fault the engine can raise is classified here so the driver can decide
//! whether it affects a single peer, a single tracker, or a whole torrent.

use std::fmt;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Classified engine error
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed or unreadable torrent descriptor (fatal to that torrent)
    DescriptorError {
        message: String,
        source: Option<String>,
    },

    /// Malformed peer traffic or handshake mismatch (closes that peer only)
    ProtocolViolation {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Piece digest did not match the descriptor (non-fatal, piece re-queued)
    HashMismatch {
        piece: u32,
    },

    /// Tracker exchange failed (non-fatal, tracker backs off)
    TrackerFailure {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Disk read/write failure (fatal to that torrent)
    IoFailure {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Invalid engine configuration
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new DescriptorError
    pub fn descriptor_error(message: impl Into<String>) -> Self {
        TorrentError::DescriptorError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new DescriptorError with source
    pub fn descriptor_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DescriptorError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new ProtocolViolation with source
    pub fn protocol_violation_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation attributed to a peer
    pub fn protocol_violation_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new HashMismatch
    pub fn hash_mismatch(piece: u32) -> Self {
        TorrentError::HashMismatch { piece }
    }

    /// Create a new TrackerFailure
    pub fn tracker_failure(message: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new TrackerFailure with tracker url
    pub fn tracker_failure_with_tracker(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerFailure with tracker url and source
    pub fn tracker_failure_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new IoFailure
    pub fn io_failure(message: impl Into<String>) -> Self {
        TorrentError::IoFailure {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new IoFailure with path and source
    pub fn io_failure_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::IoFailure {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the remote address to a protocol violation
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        if let TorrentError::ProtocolViolation { peer, .. } = &mut self {
            *peer = Some(addr.into());
        }
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::DescriptorError { source, .. }
            | TorrentError::ProtocolViolation { source, .. }
            | TorrentError::TrackerFailure { source, .. }
            | TorrentError::IoFailure { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// Whether this error ends the owning torrent rather than one peer or tracker
    pub fn is_fatal_to_torrent(&self) -> bool {
        matches!(self, TorrentError::DescriptorError { .. } | TorrentError::IoFailure { .. })
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::DescriptorError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Descriptor error: {} (source: {})", message, src)
                } else {
                    write!(f, "Descriptor error: {}", message)
                }
            }
            TorrentError::ProtocolViolation { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Protocol violation: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Protocol violation: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Protocol violation: {} (source: {})", message, s),
                    (None, None) => write!(f, "Protocol violation: {}", message),
                }
            }
            TorrentError::HashMismatch { piece } => {
                write!(f, "Hash mismatch for piece {}", piece)
            }
            TorrentError::TrackerFailure { message, tracker, source } => {
                match (tracker, source) {
                    (Some(t), Some(s)) => write!(f, "Tracker failure: {} (tracker: {}, source: {})", message, t, s),
                    (Some(t), None) => write!(f, "Tracker failure: {} (tracker: {})", message, t),
                    (None, Some(s)) => write!(f, "Tracker failure: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker failure: {}", message),
                }
            }
            TorrentError::IoFailure { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "I/O failure: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "I/O failure: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "I/O failure: {} (source: {})", message, s),
                    (None, None) => write!(f, "I/O failure: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::IoFailure {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::descriptor_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::tracker_failure_full("Invalid tracker url", "unknown", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_error() {
        let err = TorrentError::descriptor_error("Missing info dictionary");
        assert_eq!(err.to_string(), "Descriptor error: Missing info dictionary");
    }

    #[test]
    fn test_protocol_violation_full() {
        let err = TorrentError::protocol_violation_full("Oversized frame", "127.0.0.1:6881", "length 9999999");
        let text = err.to_string();
        assert!(text.contains("Protocol violation"));
        assert!(text.contains("127.0.0.1:6881"));
        assert!(text.contains("length 9999999"));
    }

    #[test]
    fn test_with_peer() {
        let err = TorrentError::protocol_violation("Bad handshake").with_peer("10.0.0.1:51413");
        assert!(err.to_string().contains("10.0.0.1:51413"));
    }

    #[test]
    fn test_hash_mismatch_display() {
        assert_eq!(TorrentError::hash_mismatch(7).to_string(), "Hash mismatch for piece 7");
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::tracker_failure("Timed out").with_context("announce started");
        assert!(err.to_string().contains("announce started"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::IoFailure { .. }));
        assert!(err.is_fatal_to_torrent());
    }

    #[test]
    fn test_from_url_error() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: TorrentError = url_err.into();
        assert!(matches!(err, TorrentError::TrackerFailure { .. }));
        assert!(!err.is_fatal_to_torrent());
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("Must be positive", "block_size");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("block_size"));
    }
}
