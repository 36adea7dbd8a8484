//! Progress display module
//!
//! Renders one status line per torrent from the engine's statistics snapshots.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::torrent::TorrentStats;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Status line of one torrent
pub fn status_line(stats: &TorrentStats) -> String {
    let eta = stats.eta.map(format_duration).unwrap_or_else(|| "∞".to_string());
    format!(
        "{}: {:.1}% {} ({} / {}) [ {} uploaded - {} hash miss - {} wasted - {} left ] [ {}/{}/{} pieces {} peers active ]",
        stats.name,
        stats.progress() * 100.0,
        format_speed(stats.download_speed),
        format_bytes(stats.downloaded),
        format_bytes(stats.total_size),
        format_bytes(stats.uploaded),
        stats.hash_misses,
        format_bytes(stats.wasted),
        eta,
        stats.completed_pieces,
        stats.pending_pieces,
        stats.total_pieces,
        stats.active_peers,
    )
}

/// Redraws a block of status lines in place
pub struct ProgressDisplay {
    last_update: Option<Instant>,
    update_interval: Duration,
    /// Lines printed by the previous redraw
    drawn: usize,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(update_interval: Duration) -> Self {
        Self {
            last_update: None,
            update_interval,
            drawn: 0,
        }
    }

    /// Redraw if the update interval has passed
    pub fn update(&mut self, stats: &[TorrentStats], now: Instant) -> io::Result<()> {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.update_interval {
                return Ok(());
            }
        }
        self.last_update = Some(now);
        self.draw(stats)
    }

    /// Redraw unconditionally
    pub fn draw(&mut self, stats: &[TorrentStats]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if self.drawn > 0 {
            // back to the first line of the previous block
            write!(out, "\x1b[{}A", self.drawn)?;
        }
        for s in stats {
            writeln!(out, "\r\x1b[2K{}", status_line(s))?;
        }
        self.drawn = stats.len();
        out.flush()
    }

    /// Print a message below the status block
    pub fn print_status(&mut self, message: &str) -> io::Result<()> {
        self.drawn = 0;
        println!("\r\x1b[2K{}", message);
        Ok(())
    }
}
