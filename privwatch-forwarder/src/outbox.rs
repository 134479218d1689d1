//! Read side of the detector's alert outbox.
//!
//! The forwarder opens the detector database read-only; it never mutates
//! alerts. Progress is tracked by the config watermark, not the table's
//! `forwarded` flag, so a crashed run replays its last batch (at-least-once).

use std::path::Path;

use rusqlite::{Connection, OpenFlags, params};

use privwatch_shared::errors::{DetectorError, DetectorResult};
use privwatch_shared::wire::AlertWire;

/// One outbox row: replay sequence plus the projected alert.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub rowid: i64,
    pub alert: AlertWire,
}

/// Open the detector database read-only.
pub fn open_outbox(path: &Path) -> DetectorResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| DetectorError::Storage(format!("{}: {}", path.display(), e)))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| DetectorError::Storage(e.to_string()))?;
    Ok(conn)
}

/// Alerts with rowid strictly greater than the watermark, oldest first.
pub fn fetch_new_alerts(
    conn: &Connection,
    last_id: i64,
    limit: u32,
) -> DetectorResult<Vec<OutboxRow>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT rowid, alert_id, rule_id, rule_name, severity, confidence,
                   description, pid, ppid, uid, new_uid, comm, parent_comm,
                   syscall, filename, timestamp
            FROM alerts
            WHERE rowid > ?1
            ORDER BY rowid ASC LIMIT ?2
            "#,
        )
        .map_err(|e| DetectorError::Storage(e.to_string()))?;

    let mapped = stmt
        .query_map(params![last_id, limit], |row| {
            Ok(OutboxRow {
                rowid: row.get(0)?,
                alert: AlertWire {
                    alert_id: row.get(1)?,
                    rule_id: row.get(2)?,
                    rule_name: row.get(3)?,
                    severity: row.get(4)?,
                    confidence: row.get(5)?,
                    description: row.get(6)?,
                    pid: row.get(7)?,
                    ppid: row.get(8)?,
                    uid: row.get(9)?,
                    new_uid: row.get(10)?,
                    comm: row.get(11)?,
                    parent_comm: row.get(12)?,
                    syscall: row.get(13)?,
                    filename: row.get(14)?,
                    timestamp: row.get(15)?,
                },
            })
        })
        .map_err(|e| DetectorError::Storage(e.to_string()))?;

    let mut rows = Vec::new();
    for row in mapped {
        rows.push(row.map_err(|e| DetectorError::Storage(e.to_string()))?);
    }
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    // Mirror of the detector's alerts DDL, enough for outbox reads.
    const TEST_SCHEMA: &str = r#"
        CREATE TABLE alerts (
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
    "#;

    /// Detector-side writable database seeded with `count` alerts.
    pub(crate) fn seeded_db(count: usize) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("detector.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(TEST_SCHEMA).unwrap();
        for i in 0..count {
            conn.execute(
                r#"
                INSERT INTO alerts
                  (alert_id, rule_id, rule_name, severity, confidence, description,
                   pid, ppid, uid, new_uid, comm, parent_comm, syscall, filename,
                   timestamp, created_at)
                VALUES (?1, 'RULE-01', 'Direct UID to Root', 'CRITICAL', 0.99, 'd',
                        42, 1, 1000, 0, 'myapp', 'bash', 'setuid', '', 1, '2026-08-01T00:00:00')
                "#,
                params![format!("alert-{}", i)],
            )
            .unwrap();
        }
        (dir, path)
    }

    #[test]
    fn test_fetch_respects_watermark_and_order() {
        let (_dir, path) = seeded_db(5);
        let conn = open_outbox(&path).unwrap();

        let rows = fetch_new_alerts(&conn, 0, 50).unwrap();
        assert_eq!(rows.len(), 5);
        let rowids: Vec<i64> = rows.iter().map(|r| r.rowid).collect();
        assert!(rowids.windows(2).all(|w| w[0] < w[1]));

        // Watermark excludes everything at or below it.
        let rows = fetch_new_alerts(&conn, rowids[2], 50).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.rowid > rowids[2]));
    }

    #[test]
    fn test_fetch_respects_batch_limit() {
        let (_dir, path) = seeded_db(5);
        let conn = open_outbox(&path).unwrap();
        assert_eq!(fetch_new_alerts(&conn, 0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_outbox_is_read_only() {
        let (_dir, path) = seeded_db(1);
        let conn = open_outbox(&path).unwrap();
        assert!(conn.execute("DELETE FROM alerts", []).is_err());
    }

    #[test]
    fn test_projection_excludes_lifecycle_fields() {
        let (_dir, path) = seeded_db(1);
        let conn = open_outbox(&path).unwrap();
        let rows = fetch_new_alerts(&conn, 0, 50).unwrap();
        let json = serde_json::to_value(&rows[0].alert).unwrap();
        assert!(json.get("acknowledged").is_none());
        assert!(json.get("forwarded").is_none());
        assert_eq!(json["alert_id"], "alert-0");
    }
}
