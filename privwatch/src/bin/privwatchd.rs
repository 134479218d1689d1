//! privwatchd: detector daemon entry point.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use privwatch::{AlertStore, Config, Database, DetectionEngine, init_logging};

/// How often the running daemon logs an engine stats snapshot.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "privwatchd", version, about = "Privilege escalation detector")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.config).context("loading config")?;
    if cli.debug {
        config.app.debug = true;
        config.logging.level = "debug".to_string();
    }
    init_logging(&config).context("initializing logging")?;

    info!("{}", "=".repeat(60));
    info!("  {} v{}", config.app.name, config.app.version);
    info!("{}", "=".repeat(60));

    info!("initializing database...");
    let db = Database::open(&config.database.path).context("opening database")?;
    let store = AlertStore::new(db);

    info!("starting detection engine...");
    let engine = Arc::new(DetectionEngine::new(&config, Some(store)).context("building engine")?);
    engine.start();

    // Periodic stats snapshot while the engine runs.
    let running = Arc::new(AtomicBool::new(true));
    let stats_engine = engine.clone();
    let stats_running = running.clone();
    let stats_thread = thread::spawn(move || {
        let mut since_last = Duration::ZERO;
        while stats_running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(1));
            since_last += Duration::from_secs(1);
            if since_last >= STATS_INTERVAL {
                since_last = Duration::ZERO;
                let stats = stats_engine.stats();
                info!(
                    "stats: processed={} dropped={} alerts={} rate_dropped={} anomalies={} eps={}",
                    stats.events_processed,
                    stats.events_dropped,
                    stats.alerts_generated,
                    stats.alerts_dropped,
                    stats.anomalies_detected,
                    stats.events_per_second,
                );
            }
        }
    });

    info!("detector running, send SIGINT or SIGTERM to stop");
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handler")?;
    if let Some(signal) = signals.forever().next() {
        info!("shutdown signal received ({})", signal);
    }

    running.store(false, Ordering::Relaxed);
    engine.stop();
    if stats_thread.join().is_err() {
        error!("stats thread panicked during shutdown");
    }

    info!("detector stopped");
    Ok(())
}
