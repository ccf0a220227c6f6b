mod cli;
mod datadir;
mod decode;
mod estimator;
mod files;
mod loader;
mod session;

use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::cli::{Cli, HELP_KEYS};
use crate::datadir::{data_dir, LOG_FILE};
use crate::decode::DecoderRegistry;
use crate::estimator::DurationEstimator;
use crate::loader::{CacheEvent, LoadState, PrefetchCache, ViewState};
use crate::session::{CacheConfig, Nav, Session};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();

    let dir = match data_dir(cli.data_dir.clone()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot create data directory: {}", e);
            None
        }
    };
    init_logging(cli.log_file, dir.as_deref());
    log::info!("vale {} started", env!("CARGO_PKG_VERSION"));

    let estimator = if cli.no_persist {
        DurationEstimator::in_memory()
    } else {
        DurationEstimator::open_in(dir.as_deref()).unwrap_or_else(|e| {
            log::warn!("Load times will not be saved: {}", e);
            DurationEstimator::in_memory()
        })
    };

    let decoders = DecoderRegistry::with_defaults();
    let estimator = Arc::new(estimator);
    let cache = match cli.threads {
        Some(n) => PrefetchCache::with_threads(decoders, estimator, n),
        None => PrefetchCache::new(decoders, estimator),
    };
    let events = cache.subscribe();
    let config = CacheConfig::new(cli.preload_depth, cli.safe_range);
    let mut session = Session::new(cache, config);

    if let Some(path) = &cli.path {
        if let Err(e) = session.open(path) {
            log::error!("{}", e);
        }
    }
    settle(&session, &events);
    println!("{}", session.status_line());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if !run_command(&mut session, line.trim()) {
            break;
        }
        settle(&session, &events);
        println!("{}", session.status_line());
        let _ = io::stdout().flush();
    }

    session.shutdown(SHUTDOWN_TIMEOUT);
    log::info!("Bye");
}

fn init_logging(to_file: bool, dir: Option<&Path>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if to_file {
        match dir.map(|d| File::create(d.join(LOG_FILE))) {
            Some(Ok(file)) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Some(Err(e)) => eprintln!("Cannot open log file: {}", e),
            None => eprintln!("No data directory for the log file"),
        }
    }
    builder.init();
}

/// Returns `false` when the user asked to quit.
fn run_command(session: &mut Session, line: &str) -> bool {
    let (cmd, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match cmd {
        "" | "n" => {
            if !session.cursor().has_next() {
                println!("Last image");
            }
            session.step(Nav::Next);
        }
        "p" => {
            if !session.cursor().has_previous() {
                println!("First image");
            }
            session.step(Nav::Previous);
        }
        "f" => {
            session.step(Nav::First);
        }
        "l" => {
            session.step(Nav::Last);
        }
        "o" => {
            if let Err(e) = session.open(&PathBuf::from(arg)) {
                println!("{}", e);
            }
        }
        "r" => {
            session.reload();
        }
        "i" => print_metadata(session),
        "z" => match (arg.parse::<u32>(), session.current()) {
            (Ok(zoom), Some(entry)) if zoom > 0 => {
                let view = entry.view_state();
                entry.set_view_state(ViewState { zoom, ..view });
            }
            _ => println!("usage: z <percent>"),
        },
        "m" => {
            if let Some(entry) = session.current() {
                let view = entry.view_state();
                entry.set_view_state(ViewState { scale_mode: view.scale_mode.cycle(), ..view });
            }
        }
        "x" => {
            if let Some(path) = session.cursor().current() {
                session.cache().cancel(path);
            }
        }
        "c" => print_cache(session),
        "q" => return false,
        "?" | "h" => print!("{}", HELP_KEYS),
        other => println!("Unknown command {:?}, ? for help", other),
    }
    true
}

/// Wait until the current image is resolved, logging progress while it
/// loads. Events from neighbors finishing just wake the loop up.
fn settle(session: &Session, events: &Receiver<CacheEvent>) {
    let Some(entry) = session.current() else { return };
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while !entry.is_disposed() && matches!(entry.state(), LoadState::Loading) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match events.recv_timeout(Duration::from_millis(100).min(deadline - now)) {
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if entry.expected_duration_ms() > 0.0 {
                    log::debug!("{}", session.status_line());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if entry.state() == LoadState::Loaded {
        log::debug!(
            "{} took {:.0}ms (expected {:.0}ms)",
            entry.file_name(),
            entry.actual_duration_ms(),
            entry.expected_duration_ms()
        );
    }
    // Stale wakeups from earlier positions.
    while events.try_recv().is_ok() {}
}

fn print_metadata(session: &Session) {
    let Some(entry) = session.current() else { return };
    let mut metadata: Vec<(String, String)> = entry.metadata().into_iter().collect();
    if metadata.is_empty() {
        println!("No metadata");
        return;
    }
    metadata.sort();
    for (key, value) in metadata {
        println!("  {:<14} {}", key, value);
    }
}

fn print_cache(session: &Session) {
    let config = session.config();
    println!(
        "  preload depth {}, safe range {}, {} entries",
        config.preload_depth,
        config.safe_range,
        session.cache().len()
    );
    let pinned = session.cache().pinned();
    for path in session.cache().tracked_paths() {
        let Some(entry) = session.cache().get(&path) else { continue };
        let info = entry.snapshot();
        println!(
            "  {}{:<32} {:?} expected {:.0}ms actual {:.0}ms",
            if pinned.as_ref() == Some(&path) { "*" } else { " " },
            entry.file_name(),
            info.state,
            info.expected_ms,
            info.actual_ms,
        );
    }
}
