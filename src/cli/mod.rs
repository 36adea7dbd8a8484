//! CLI module
//!
//! Command-line interface of the engine binary.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::{format_bytes, format_duration, ProgressDisplay};
