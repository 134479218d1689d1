//! Forwarding loop.
//!
//! Each iteration reads the next outbox batch past the watermark, POSTs it,
//! and on success advances and persists the watermark. Delivery is
//! at-least-once; the collector deduplicates on `alert_id`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{error, info, warn};

use privwatch_shared::errors::{DetectorError, DetectorResult};

use crate::config::ForwarderConfig;
use crate::ingest::{IngestClient, IngestError};
use crate::outbox::{self, OutboxRow};

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const BATCH_SIZE: u32 = 50;
pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Result of one loop iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing past the watermark.
    Idle,
    /// Batch accepted; watermark advanced.
    Synced { count: usize, inserted: u64 },
    /// Batch not accepted after retries; watermark unchanged.
    Failed,
    /// Credentials rejected; stop until reconfigured.
    Unauthorized,
}

/// One fetch-and-post iteration against an open outbox connection.
///
/// Advances `config.last_synced_id` in memory on success; the caller
/// persists the config.
pub fn sync_once(
    conn: &Connection,
    config: &mut ForwarderConfig,
    client: &dyn IngestClient,
    sleeper: &dyn Fn(Duration),
) -> DetectorResult<SyncOutcome> {
    let rows = outbox::fetch_new_alerts(conn, config.last_synced_id, BATCH_SIZE)?;
    if rows.is_empty() {
        return Ok(SyncOutcome::Idle);
    }

    info!(
        "forwarding {} alerts (rowid > {})",
        rows.len(),
        config.last_synced_id
    );

    match post_with_retry(client, &rows, sleeper) {
        Ok(inserted) => {
            let last = rows.last().map(|r| r.rowid).unwrap_or(config.last_synced_id);
            config.last_synced_id = last;
            config.last_sync_time = Some(Utc::now().to_rfc3339());
            info!("synced {} alerts (last rowid: {})", inserted, last);
            Ok(SyncOutcome::Synced {
                count: rows.len(),
                inserted,
            })
        }
        Err(IngestError::Unauthorized) => Ok(SyncOutcome::Unauthorized),
        Err(e) => {
            warn!("batch not delivered: {}", e);
            Ok(SyncOutcome::Failed)
        }
    }
}

/// Linear-backoff retry around one POST. Unauthorized aborts immediately.
fn post_with_retry(
    client: &dyn IngestClient,
    rows: &[OutboxRow],
    sleeper: &dyn Fn(Duration),
) -> Result<u64, IngestError> {
    let batch: Vec<_> = rows.iter().map(|r| r.alert.clone()).collect();

    let mut last_error = IngestError::Transport("no attempts made".to_string());
    for attempt in 1..=RETRY_ATTEMPTS {
        match client.post(&batch) {
            Ok(inserted) => return Ok(inserted),
            Err(IngestError::Unauthorized) => return Err(IngestError::Unauthorized),
            Err(e) => {
                warn!("attempt {} failed: {}", attempt, e);
                last_error = e;
            }
        }
        if attempt < RETRY_ATTEMPTS {
            sleeper(RETRY_DELAY * attempt);
        }
    }
    Err(last_error)
}

/// The long-running forwarder loop. Returns on SIGINT or fatal credentials.
pub fn run(config_path: &Path, db_path: &Path) -> DetectorResult<()> {
    let mut config = ForwarderConfig::load(config_path)?.ok_or_else(|| {
        DetectorError::Config("not configured, run with --setup first".to_string())
    })?;

    let client = crate::ingest::HttpIngest::new(&config.vercel_url, &config.api_key)
        .map_err(|e| DetectorError::Forward(e.to_string()))?;

    info!(
        "starting: machine {} -> {}",
        config.machine_name, config.vercel_url
    );
    info!(
        "poll: {}s, batch: {}, watermark: {}",
        POLL_INTERVAL.as_secs(),
        BATCH_SIZE,
        config.last_synced_id
    );

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| DetectorError::Internal(format!("signal handler: {}", e)))?;

    let sleeper = |d: Duration| std::thread::sleep(d);

    while running.load(Ordering::SeqCst) {
        match run_iteration(&mut config, config_path, db_path, &client, &sleeper) {
            Ok(SyncOutcome::Unauthorized) => {
                error!("invalid API key, run --setup again");
                return Err(DetectorError::Forward("invalid credentials".to_string()));
            }
            Ok(_) => {}
            // Transient (database missing, poll error): next poll retries.
            Err(e) => warn!("poll error: {}", e),
        }

        // Sleep in one-second slices so shutdown stays responsive.
        let mut slept = Duration::ZERO;
        while slept < POLL_INTERVAL && running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            slept += Duration::from_secs(1);
        }
    }

    info!("forwarder stopped");
    Ok(())
}

fn run_iteration(
    config: &mut ForwarderConfig,
    config_path: &Path,
    db_path: &Path,
    client: &dyn IngestClient,
    sleeper: &dyn Fn(Duration),
) -> DetectorResult<SyncOutcome> {
    if !db_path.exists() {
        warn!("database not found: {}", db_path.display());
        return Ok(SyncOutcome::Idle);
    }
    let conn = outbox::open_outbox(db_path)?;
    let outcome = sync_once(&conn, config, client, sleeper)?;
    if matches!(outcome, SyncOutcome::Synced { .. }) {
        config.save(config_path)?;
    }
    Ok(outcome)
}
