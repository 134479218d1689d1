//! privwatch detection library.
//!
//! Host-based privilege-escalation detection: a kernel probe feeds
//! security-relevant syscalls into a rule engine whose alerts land in a
//! durable outbox, shipped to a remote collector by a separate forwarder.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod config;
pub mod db;
pub mod engine;
pub mod probe;

pub use config::Config;
pub use db::{AlertStats, AlertStore, Database, RuleCount};
pub use engine::alert::{AlertManager, AlertRecord, Severity};
pub use engine::anomaly::{AnomalyDetector, AnomalyEvent};
pub use engine::baseline::BaselineStore;
pub use engine::rules::{Detection, RuleEngine, RuleId};
pub use engine::{DetectionEngine, EngineStats};
pub use probe::record::{Event, Syscall};
pub use probe::{Probe, ProbeStatus};

pub use privwatch_shared::errors::{DetectorError, DetectorResult};

/// Initialize tracing from the logging section of the config.
///
/// Console output goes to stderr, file output to a daily-rolling log under
/// the configured path's directory. `RUST_LOG` overrides the configured
/// level. Idempotent: subsequent calls return immediately once initialized.
pub fn init_logging(config: &Config) -> DetectorResult<()> {
    let logging = &config.logging;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = if logging.file_enabled {
        let dir = logging
            .file_path
            .parent()
            .unwrap_or(std::path::Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| {
            DetectorError::Config(format!("log directory {}: {}", dir.display(), e))
        })?;
        let prefix = logging
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "detector.log".to_string());

        let file_appender = tracing_appender::rolling::daily(dir, prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
    } else {
        None
    };

    let console_layer = logging
        .console_enabled
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    // If a global subscriber is already set (tests, embedding hosts), keep it.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Ok(())
}
