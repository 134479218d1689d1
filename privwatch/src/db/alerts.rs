//! Alert table operations.
//!
//! The alerts table doubles as the forwarder's outbox: `rowid` is the replay
//! sequence and `forwarded` the high-water flag. Inserts are idempotent on
//! `alert_id` so replayed detections collapse instead of duplicating.

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use privwatch_shared::errors::DetectorResult;

use crate::engine::alert::{AlertRecord, Severity, iso_timestamp};

use super::{Database, db_err};

/// Alert storage wrapping [`Database`].
#[derive(Clone)]
pub struct AlertStore {
    db: Database,
}

/// Aggregates returned by [`AlertStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct AlertStats {
    pub by_severity: Vec<(String, u64)>,
    pub top_rules: Vec<RuleCount>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct RuleCount {
    pub rule_id: String,
    pub rule_name: String,
    pub count: u64,
}

impl AlertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an alert. Returns false when `alert_id` already exists
    /// (INSERT OR IGNORE keeps replays idempotent).
    pub fn save_alert(&self, alert: &AlertRecord) -> DetectorResult<bool> {
        let conn = self.db.conn();
        let inserted = db_err!(conn.execute(
            r#"
            INSERT OR IGNORE INTO alerts
              (alert_id, rule_id, rule_name, severity, confidence, description,
               pid, ppid, uid, new_uid, comm, parent_comm, syscall, filename,
               timestamp, created_at, acknowledged, forwarded)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0, 0)
            "#,
            params![
                alert.alert_id,
                alert.rule_id,
                alert.rule_name,
                alert.severity.as_str(),
                alert.confidence,
                alert.description,
                alert.pid,
                alert.ppid,
                alert.uid,
                alert.new_uid,
                alert.comm,
                alert.parent_comm,
                alert.syscall,
                alert.filename,
                alert.timestamp as i64,
                alert.created_at,
            ],
        ))?;
        Ok(inserted > 0)
    }

    /// Alerts from the last `hours`, newest first, optionally filtered by
    /// severity.
    pub fn recent(
        &self,
        hours: i64,
        limit: u32,
        severity: Option<Severity>,
    ) -> DetectorResult<Vec<AlertRecord>> {
        let since = iso_timestamp(Utc::now() - chrono::Duration::hours(hours));
        let conn = self.db.conn();

        let mut rows = Vec::new();
        match severity {
            Some(severity) => {
                let mut stmt = db_err!(conn.prepare(
                    r#"
                    SELECT * FROM alerts
                    WHERE created_at >= ?1 AND severity = ?2
                    ORDER BY created_at DESC LIMIT ?3
                    "#
                ))?;
                let mapped = db_err!(
                    stmt.query_map(params![since, severity.as_str(), limit], row_to_alert)
                )?;
                for row in mapped {
                    rows.push(db_err!(row)?);
                }
            }
            None => {
                let mut stmt = db_err!(conn.prepare(
                    r#"
                    SELECT * FROM alerts
                    WHERE created_at >= ?1
                    ORDER BY created_at DESC LIMIT ?2
                    "#
                ))?;
                let mapped = db_err!(stmt.query_map(params![since, limit], row_to_alert))?;
                for row in mapped {
                    rows.push(db_err!(row)?);
                }
            }
        }
        Ok(rows)
    }

    pub fn get_by_id(&self, alert_id: &str) -> DetectorResult<Option<AlertRecord>> {
        let conn = self.db.conn();
        let alert = db_err!(
            conn.query_row(
                "SELECT * FROM alerts WHERE alert_id = ?1",
                params![alert_id],
                row_to_alert,
            )
            .optional()
        )?;
        Ok(alert)
    }

    /// Mark an alert acknowledged. Returns false for an unknown id.
    ///
    /// The table has no notes column; notes are kept in the log only.
    pub fn acknowledge(
        &self,
        alert_id: &str,
        user: &str,
        notes: Option<&str>,
    ) -> DetectorResult<bool> {
        if let Some(notes) = notes {
            debug!("acknowledging {} by {}: {}", alert_id, user, notes);
        }
        let conn = self.db.conn();
        let updated = db_err!(conn.execute(
            r#"
            UPDATE alerts SET acknowledged = 1, acknowledged_by = ?1, acknowledged_at = ?2
            WHERE alert_id = ?3
            "#,
            params![user, iso_timestamp(Utc::now()), alert_id],
        ))?;
        Ok(updated > 0)
    }

    /// Severity breakdown and top-10 rules for the last `hours`.
    pub fn stats(&self, hours: i64) -> DetectorResult<AlertStats> {
        let since = iso_timestamp(Utc::now() - chrono::Duration::hours(hours));
        let conn = self.db.conn();

        let mut by_severity = Vec::new();
        let mut total = 0u64;
        {
            let mut stmt = db_err!(conn.prepare(
                r#"
                SELECT severity, COUNT(*) FROM alerts
                WHERE created_at >= ?1 GROUP BY severity
                "#
            ))?;
            let mapped = db_err!(stmt.query_map(params![since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            }))?;
            for row in mapped {
                let (severity, count) = db_err!(row)?;
                total += count;
                by_severity.push((severity, count));
            }
        }

        let mut top_rules = Vec::new();
        {
            let mut stmt = db_err!(conn.prepare(
                r#"
                SELECT rule_id, rule_name, COUNT(*) as count FROM alerts
                WHERE created_at >= ?1
                GROUP BY rule_id ORDER BY count DESC LIMIT 10
                "#
            ))?;
            let mapped = db_err!(stmt.query_map(params![since], |row| {
                Ok(RuleCount {
                    rule_id: row.get(0)?,
                    rule_name: row.get(1)?,
                    count: row.get(2)?,
                })
            }))?;
            for row in mapped {
                top_rules.push(db_err!(row)?);
            }
        }

        Ok(AlertStats {
            by_severity,
            top_rules,
            total,
        })
    }

    /// Outbox read: not-yet-forwarded alerts in ascending rowid order.
    pub fn unforwarded(&self, limit: u32) -> DetectorResult<Vec<(i64, AlertRecord)>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            r#"
            SELECT rowid, * FROM alerts
            WHERE forwarded = 0
            ORDER BY rowid ASC LIMIT ?1
            "#
        ))?;
        let mapped = db_err!(stmt.query_map(params![limit], |row| {
            Ok((row.get::<_, i64>(0)?, row_to_alert_offset(row, 1)?))
        }))?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(db_err!(row)?);
        }
        Ok(rows)
    }

    /// Flip the forwarded flag for a batch of rowids, atomically.
    pub fn mark_forwarded(&self, rowids: &[i64]) -> DetectorResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;
        {
            let mut stmt = db_err!(tx.prepare("UPDATE alerts SET forwarded = 1 WHERE rowid = ?1"))?;
            for rowid in rowids {
                db_err!(stmt.execute(params![rowid]))?;
            }
        }
        db_err!(tx.commit())?;
        Ok(())
    }
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    row_to_alert_offset(row, 0)
}

/// Map a SELECT * row starting at `base` (non-zero when rowid is prepended).
fn row_to_alert_offset(row: &Row<'_>, base: usize) -> rusqlite::Result<AlertRecord> {
    let severity: String = row.get(base + 3)?;
    Ok(AlertRecord {
        alert_id: row.get(base)?,
        rule_id: row.get(base + 1)?,
        rule_name: row.get(base + 2)?,
        severity: severity.parse().unwrap_or(Severity::Critical),
        confidence: row.get(base + 4)?,
        description: row.get(base + 5)?,
        pid: row.get(base + 6)?,
        ppid: row.get(base + 7)?,
        uid: row.get(base + 8)?,
        new_uid: row.get(base + 9)?,
        comm: row.get(base + 10)?,
        parent_comm: row.get(base + 11)?,
        syscall: row.get(base + 12)?,
        filename: row.get(base + 13)?,
        timestamp: row.get::<_, i64>(base + 14)? as u64,
        created_at: row.get(base + 15)?,
        acknowledged: row.get::<_, i64>(base + 16)? != 0,
        acknowledged_by: row.get(base + 17)?,
        acknowledged_at: row.get(base + 18)?,
        forwarded: row.get::<_, i64>(base + 19)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (AlertStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (AlertStore::new(db), dir)
    }

    fn alert(alert_id: &str, rule_id: &str) -> AlertRecord {
        AlertRecord {
            alert_id: alert_id.to_string(),
            rule_id: rule_id.to_string(),
            rule_name: "Direct UID to Root".to_string(),
            severity: Severity::Critical,
            confidence: 0.99,
            description: "UID 1000 -> root via setuid (PID 42, myapp)".to_string(),
            pid: 42,
            ppid: 1,
            uid: 1000,
            new_uid: 0,
            comm: "myapp".to_string(),
            parent_comm: "bash".to_string(),
            syscall: "setuid".to_string(),
            filename: String::new(),
            timestamp: 123456,
            created_at: iso_timestamp(Utc::now()),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            forwarded: false,
        }
    }

    #[test]
    fn test_save_alert_is_idempotent() {
        let (store, _dir) = test_store();
        assert!(store.save_alert(&alert("id-1", "RULE-01")).unwrap());
        // Same alert_id again: ignored, store unchanged.
        assert!(!store.save_alert(&alert("id-1", "RULE-01")).unwrap());
        assert_eq!(store.recent(1, 100, None).unwrap().len(), 1);
    }

    #[test]
    fn test_get_by_id() {
        let (store, _dir) = test_store();
        store.save_alert(&alert("id-1", "RULE-01")).unwrap();

        let loaded = store.get_by_id("id-1").unwrap().unwrap();
        assert_eq!(loaded.rule_id, "RULE-01");
        assert_eq!(loaded.severity, Severity::Critical);
        assert_eq!(loaded.pid, 42);
        assert!(store.get_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_recent_severity_filter() {
        let (store, _dir) = test_store();
        store.save_alert(&alert("id-1", "RULE-01")).unwrap();

        assert_eq!(
            store.recent(1, 100, Some(Severity::Critical)).unwrap().len(),
            1
        );
        assert!(store.recent(1, 100, Some(Severity::Low)).unwrap().is_empty());
    }

    #[test]
    fn test_acknowledge() {
        let (store, _dir) = test_store();
        store.save_alert(&alert("id-1", "RULE-01")).unwrap();

        assert!(store.acknowledge("id-1", "analyst", Some("triaged")).unwrap());
        let loaded = store.get_by_id("id-1").unwrap().unwrap();
        assert!(loaded.acknowledged);
        assert_eq!(loaded.acknowledged_by.as_deref(), Some("analyst"));
        assert!(loaded.acknowledged_at.is_some());

        assert!(!store.acknowledge("missing", "analyst", None).unwrap());
    }

    #[test]
    fn test_stats_counts_by_severity_and_rule() {
        let (store, _dir) = test_store();
        store.save_alert(&alert("id-1", "RULE-01")).unwrap();
        store.save_alert(&alert("id-2", "RULE-01")).unwrap();
        store.save_alert(&alert("id-3", "RULE-02")).unwrap();

        let stats = store.stats(1).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_severity, vec![("CRITICAL".to_string(), 3)]);
        assert_eq!(stats.top_rules[0].rule_id, "RULE-01");
        assert_eq!(stats.top_rules[0].count, 2);
    }

    #[test]
    fn test_unforwarded_ascending_and_mark_forwarded() {
        let (store, _dir) = test_store();
        for i in 1..=5 {
            store.save_alert(&alert(&format!("id-{}", i), "RULE-01")).unwrap();
        }

        let pending = store.unforwarded(10).unwrap();
        assert_eq!(pending.len(), 5);
        let rowids: Vec<i64> = pending.iter().map(|(rowid, _)| *rowid).collect();
        let mut sorted = rowids.clone();
        sorted.sort_unstable();
        assert_eq!(rowids, sorted);

        store.mark_forwarded(&rowids[..3]).unwrap();
        let remaining = store.unforwarded(10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|(rowid, _)| !rowids[..3].contains(rowid)));
    }

    #[test]
    fn test_unforwarded_respects_limit() {
        let (store, _dir) = test_store();
        for i in 1..=5 {
            store.save_alert(&alert(&format!("id-{}", i), "RULE-01")).unwrap();
        }
        assert_eq!(store.unforwarded(2).unwrap().len(), 2);
    }
}
