//! Torrent statistics
//!
//! Point-in-time snapshot of a torrent's progress, and the rolling speed
//! meter it is computed from.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window the download speed is averaged over
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Snapshot of one torrent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentStats {
    pub name: String,
    pub total_size: u64,
    /// Block payload received, including wasted bytes
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes discarded by failed hash checks or duplicate blocks
    pub wasted: u64,
    pub hash_misses: u64,
    /// Bytes per second over the last few seconds
    pub download_speed: f64,
    pub eta: Option<Duration>,
    pub completed_pieces: usize,
    /// Pieces with at least one block held or requested
    pub pending_pieces: usize,
    pub total_pieces: usize,
    pub active_peers: usize,
}

impl TorrentStats {
    /// Fraction of pieces verified (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_pieces == 0 {
            return 1.0;
        }
        self.completed_pieces as f64 / self.total_pieces as f64
    }

    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }
}

/// Rolling byte counter
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` transferred at `now`
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes per second over the window ending at `now`
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        total as f64 / SPEED_WINDOW.as_secs_f64()
    }
}

/// Time left at `speed` bytes per second, if any progress is being made
pub fn estimate_eta(left: u64, speed: f64) -> Option<Duration> {
    if left == 0 || speed <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(left as f64 / speed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_meter_window() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new();
        meter.record(start, 5000);
        meter.record(start + Duration::from_secs(1), 5000);
        assert_eq!(meter.rate(start + Duration::from_secs(1)), 2000.0);

        // first sample falls out of the window
        assert_eq!(meter.rate(start + Duration::from_millis(5500)), 1000.0);
        assert_eq!(meter.rate(start + Duration::from_secs(10)), 0.0);
    }

    #[test]
    fn test_estimate_eta() {
        assert_eq!(estimate_eta(1000, 100.0), Some(Duration::from_secs(10)));
        assert_eq!(estimate_eta(0, 100.0), None);
        assert_eq!(estimate_eta(1000, 0.0), None);
    }

    #[test]
    fn test_progress() {
        let stats = TorrentStats {
            completed_pieces: 1,
            total_pieces: 4,
            ..Default::default()
        };
        assert_eq!(stats.progress(), 0.25);
        assert!(!stats.is_complete());
    }
}
