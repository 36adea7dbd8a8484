//! torrent-engine - Main entry point
//!
//! Downloads, then optionally seeds, every torrent given on the command line.

use std::fs::File;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use torrent_engine::cli::{CliArgs, ProgressDisplay};
use torrent_engine::{DownloadState, Outcome, Session};
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!("PANIC occurred at {}:{}:{}", location.file(), location.line(), location.column());
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Send logs to the log file; the terminal is left to the status display
fn init_logging(args: &CliArgs) -> Result<()> {
    let file = File::create(&args.log).with_context(|| format!("Cannot open log file {}", args.log.display()))?;
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    debug!("Logging initialized with level {:?}", args.log_level());
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args)?;
    setup_panic_handler();
    info!("torrent-engine starting");
    debug!("CLI arguments: {:?}", args);

    let config = args.to_config();
    config.validate().context("Invalid configuration")?;
    let seed = config.seed;
    let mut session = Session::new(config).context("Failed to start session")?;

    for path in &args.torrents {
        eprint!("Scanning: {}... ", path.display());
        match session.add(path) {
            Ok(_) => eprintln!("Done"),
            Err(e) => eprintln!("corrupted torrent file: {}", e),
        }
    }

    if args.nodownload {
        for line in session.inspect() {
            eprintln!("{}", line);
        }
    } else {
        for (id, state) in session.prepare_all(Instant::now()) {
            let label = session.label(id).unwrap_or_default();
            match state {
                DownloadState::None => eprintln!("Prepared {}", label),
                DownloadState::Completed => eprintln!("Prepared {} (already downloaded)", label),
                DownloadState::Error => eprintln!("Failed to prepare {}", label),
            }
        }
    }

    let mut display = ProgressDisplay::new(Duration::from_millis(500));
    if !args.nodownload && !session.is_download_done() {
        eprintln!("Downloading torrents...");
        while !session.is_download_done() {
            let now = Instant::now();
            session.download_step(now).context("Download loop failed")?;
            display.update(&session.stats(now), now)?;
        }
        display.draw(&session.stats(Instant::now()))?;
    }
    display.print_status("Done downloading")?;

    let any_completed = session.report().iter().any(|(_, _, o)| *o == Outcome::Completed);
    if !args.nodownload && seed && any_completed {
        display.print_status("Now seeding")?;
        session.start_seeding();
        while !session.is_seed_done() {
            let now = Instant::now();
            session.seed_step(now).context("Seed loop failed")?;
            display.update(&session.stats(now), now)?;
        }
    }
    session.shutdown(Instant::now());

    for (id, label, outcome) in session.report() {
        match outcome {
            Outcome::Completed => eprintln!("Completed: {}", label),
            Outcome::Failed => match session.failure(id) {
                Some(e) => eprintln!("Something went wrong downloading: {} ({})", label, e),
                None => eprintln!("Something went wrong downloading: {}", label),
            },
            Outcome::SeedFailed => eprintln!("Failed to seed: {}", label),
            Outcome::Incomplete => eprintln!("Incomplete: {}", label),
        }
    }

    eprintln!("Finished");
    info!("torrent-engine finished");
    Ok(())
}
