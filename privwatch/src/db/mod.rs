//! SQLite storage.
//!
//! One shared connection behind a mutex. Writers (alert manager) and readers
//! (API surface) go through the same handle; the forwarder process opens its
//! own read-only connection, which WAL journaling makes safe.

mod alerts;

pub use self::alerts::{AlertStats, AlertStore, RuleCount};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::info;

use privwatch_shared::errors::DetectorResult;

/// Map a rusqlite error into a storage error.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| $crate::DetectorError::Storage(e.to_string()))
    };
}
pub(crate) use db_err;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    alert_id        TEXT PRIMARY KEY,
    rule_id         TEXT,
    rule_name       TEXT,
    severity        TEXT,
    confidence      REAL,
    description     TEXT,
    pid             INTEGER,
    ppid            INTEGER,
    uid             INTEGER,
    new_uid         INTEGER,
    comm            TEXT,
    parent_comm     TEXT,
    syscall         TEXT,
    filename        TEXT,
    timestamp       INTEGER,
    created_at      TEXT,
    acknowledged    INTEGER DEFAULT 0,
    acknowledged_by TEXT,
    acknowledged_at TEXT,
    forwarded       INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_severity   ON alerts(severity);
CREATE INDEX IF NOT EXISTS idx_alerts_forwarded  ON alerts(forwarded);
"#;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating as needed) the database at `path` and apply the schema.
    ///
    /// WAL journaling plus synchronous=NORMAL lets the forwarder read the
    /// outbox concurrently with alert writes.
    pub fn open(path: &Path) -> DetectorResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(path))?;
        db_err!(conn.busy_timeout(Duration::from_secs(10)))?;
        // journal_mode returns the resulting mode as a row.
        db_err!(conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)))?;
        db_err!(conn.pragma_update(None, "synchronous", "NORMAL"))?;
        db_err!(conn.execute_batch(SCHEMA))?;

        info!("database initialized: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
