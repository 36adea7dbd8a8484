//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "torrent-engine", version)]
#[command(about = "Download and seed torrents over one poll loop", long_about = None)]
#[command(after_help = "Example: torrent-engine --nodownload --torrents a.torrent b.torrent c.torrent")]
pub struct CliArgs {
    /// Start port for the torrents' listeners, one port per torrent
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Peers per torrent to feel sufficient with, 0 implies as many as possible
    #[arg(short = 'm', long, default_value_t = 30)]
    pub peers: usize,

    /// Do not download anything, just print info about the torrents
    #[arg(short, long)]
    pub nodownload: bool,

    /// Block size requested from peers, rounded up to a power of two
    #[arg(short = 's', long, value_name = "BYTES")]
    pub piecesize: Option<u32>,

    /// Downloads directory
    #[arg(short, long, value_name = "DIR", default_value = "Torrents")]
    pub dldir: PathBuf,

    /// Do not seed after the download has finished
    #[arg(short = 'e', long)]
    pub noseed: bool,

    /// Log file name
    #[arg(short, long, value_name = "FILE", default_value = "out.txt")]
    pub log: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Torrent file(s)
    #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
    pub torrents: Vec<PathBuf>,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Engine settings for these arguments
    pub fn to_config(&self) -> Config {
        let config = Config {
            start_port: self.port,
            max_peers: self.peers,
            download_dir: self.dldir.clone(),
            seed: !self.noseed,
            ..Config::default()
        };
        match self.piecesize {
            Some(size) => config.with_block_size(size),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BLOCK_SIZE;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["torrent-engine", "-t", "a.torrent"]).unwrap();
        assert_eq!(args.port, 6881);
        assert_eq!(args.peers, 30);
        assert!(!args.nodownload);
        assert!(!args.noseed);
        assert_eq!(args.dldir, PathBuf::from("Torrents"));
        assert_eq!(args.torrents, vec![PathBuf::from("a.torrent")]);

        let config = args.to_config();
        assert!(config.seed);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_flags_map_to_config() {
        let args = CliArgs::try_parse_from([
            "torrent-engine",
            "-p",
            "7000",
            "-m",
            "0",
            "-s",
            "10000",
            "-e",
            "-d",
            "downloads",
            "-t",
            "a.torrent",
            "b.torrent",
        ])
        .unwrap();
        assert_eq!(args.torrents.len(), 2);

        let config = args.to_config();
        assert_eq!(config.start_port, 7000);
        assert_eq!(config.max_peers, 0);
        assert_eq!(config.block_size, 16384);
        assert!(!config.seed);
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_torrents_required() {
        assert!(CliArgs::try_parse_from(["torrent-engine", "-n"]).is_err());
    }
}
