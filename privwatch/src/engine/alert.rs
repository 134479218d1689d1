//! Alert manager: normalization, deduplication, rate limiting, persistence
//! and subscriber fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::AlertStore;
use crate::engine::rules::{Detection, RuleId};

/// Window during which alerts with the same dedup key are suppressed.
const DEDUP_WINDOW: Duration = Duration::from_secs(600);

/// Dedup cache size that triggers a sweep of aged-out entries.
const DEDUP_CACHE_MAX: usize = 500;

/// Sliding window for the per-minute rate cap.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fully normalized alert, as persisted and fanned out.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub alert_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub new_uid: u32,
    pub comm: String,
    pub parent_comm: String,
    pub syscall: String,
    pub filename: String,
    pub timestamp: u64,
    pub created_at: String,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<String>,
    pub forwarded: bool,
}

/// Sortable UTC timestamp, the format used for `created_at` columns.
pub(crate) fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Dedup key: rule plus the identity fields that rule dedups on.
type DedupKey = (RuleId, u32, Option<String>);

/// Narrow keys for the uid-driven rules, wider keys where the binary or the
/// path differentiates genuinely distinct activity.
fn dedup_key(detection: &Detection) -> DedupKey {
    let event = &detection.event;
    match detection.rule {
        RuleId::UidToRoot | RuleId::CapabilityAbuse => (detection.rule, event.uid, None),
        RuleId::KernelModuleAbuse => (detection.rule, event.uid, Some(event.comm.clone())),
        _ => (detection.rule, event.uid, Some(event.filename.clone())),
    }
}

struct LimiterState {
    dedup: HashMap<DedupKey, Instant>,
    recent: VecDeque<Instant>,
}

/// Accepts detections from the rule engine and turns the survivors into
/// persisted, fanned-out alerts.
pub struct AlertManager {
    max_per_minute: usize,
    store: Option<AlertStore>,
    state: Mutex<LimiterState>,
    subscribers: Mutex<Vec<Sender<AlertRecord>>>,
    generated: AtomicU64,
    dropped: AtomicU64,
}

impl AlertManager {
    pub fn new(max_per_minute: usize, store: Option<AlertStore>) -> Self {
        Self {
            max_per_minute,
            store,
            state: Mutex::new(LimiterState {
                dedup: HashMap::new(),
                recent: VecDeque::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            generated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber channel. Every generated alert is sent to every
    /// subscriber; a disconnected subscriber is logged and skipped.
    pub fn add_subscriber(&self, tx: Sender<AlertRecord>) {
        self.subscribers.lock().push(tx);
    }

    /// Process one detection. Returns true if an alert was generated.
    pub fn process(&self, detection: Detection) -> bool {
        self.process_at(detection, Instant::now(), Utc::now())
    }

    /// Process with explicit clocks, for deterministic tests.
    pub fn process_at(&self, detection: Detection, now: Instant, wall: DateTime<Utc>) -> bool {
        {
            let mut state = self.state.lock();

            let key = dedup_key(&detection);
            if let Some(&last_seen) = state.dedup.get(&key) {
                if now.duration_since(last_seen) < DEDUP_WINDOW {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            state.dedup.insert(key, now);
            if state.dedup.len() > DEDUP_CACHE_MAX {
                state
                    .dedup
                    .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
            }

            while let Some(&oldest) = state.recent.front() {
                if now.duration_since(oldest) > RATE_WINDOW {
                    state.recent.pop_front();
                } else {
                    break;
                }
            }
            if state.recent.len() >= self.max_per_minute {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            state.recent.push_back(now);
        }

        let record = normalize(detection, wall);

        if let Some(store) = &self.store {
            if let Err(e) = store.save_alert(&record) {
                // Storage trouble must not stall detection.
                error!("failed to save alert {}: {}", record.alert_id, e);
            }
        }

        warn!(
            "[{}] {}: {}",
            record.severity, record.rule_id, record.description
        );

        let subscribers = self.subscribers.lock();
        for tx in subscribers.iter() {
            if tx.send(record.clone()).is_err() {
                debug!("alert subscriber disconnected");
            }
        }

        self.generated.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn normalize(detection: Detection, wall: DateTime<Utc>) -> AlertRecord {
    let event = detection.event;
    AlertRecord {
        alert_id: Uuid::new_v4().to_string(),
        rule_id: detection.rule.as_str().to_string(),
        rule_name: detection.rule.name().to_string(),
        severity: detection.rule.severity(),
        confidence: (detection.confidence * 1000.0).round() / 1000.0,
        description: detection.description,
        pid: event.pid,
        ppid: event.ppid,
        uid: event.uid,
        new_uid: event.new_uid,
        comm: event.comm,
        parent_comm: event.parent_comm,
        syscall: event.syscall.as_str().to_string(),
        filename: event.filename,
        timestamp: event.timestamp,
        created_at: iso_timestamp(wall),
        acknowledged: false,
        acknowledged_by: None,
        acknowledged_at: None,
        forwarded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::record::{Event, Syscall};

    fn detection(rule: RuleId, uid: u32, filename: &str) -> Detection {
        Detection {
            rule,
            confidence: 0.99,
            description: "test detection".to_string(),
            event: Event {
                pid: 42,
                ppid: 1,
                uid,
                euid: uid,
                gid: uid,
                new_uid: 0,
                new_gid: 0,
                timestamp: 1,
                syscall: Syscall::Setuid,
                comm: "myapp".to_string(),
                parent_comm: "bash".to_string(),
                filename: filename.to_string(),
                open_flags: 0,
            },
        }
    }

    #[test]
    fn test_dedup_window_suppresses_then_allows() {
        let manager = AlertManager::new(1000, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        assert!(manager.process_at(detection(RuleId::UidToRoot, 1000, ""), t0, wall));
        // Just inside the window: suppressed.
        assert!(!manager.process_at(
            detection(RuleId::UidToRoot, 1000, ""),
            t0 + Duration::from_secs(599),
            wall
        ));
        assert_eq!(manager.dropped(), 1);
        // Just past the window: allowed again.
        assert!(manager.process_at(
            detection(RuleId::UidToRoot, 1000, ""),
            t0 + Duration::from_secs(601),
            wall
        ));
        assert_eq!(manager.generated(), 2);
    }

    #[test]
    fn test_dedup_key_is_uid_scoped_for_rule01() {
        let manager = AlertManager::new(1000, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        assert!(manager.process_at(detection(RuleId::UidToRoot, 1000, "/a"), t0, wall));
        // Same uid, different path: still deduplicated.
        assert!(!manager.process_at(detection(RuleId::UidToRoot, 1000, "/b"), t0, wall));
        // Different uid: distinct key.
        assert!(manager.process_at(detection(RuleId::UidToRoot, 1001, "/a"), t0, wall));
    }

    #[test]
    fn test_dedup_key_includes_path_for_rule07() {
        let manager = AlertManager::new(1000, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        assert!(manager.process_at(detection(RuleId::SuidWritablePath, 1000, "/tmp/a"), t0, wall));
        assert!(manager.process_at(detection(RuleId::SuidWritablePath, 1000, "/tmp/b"), t0, wall));
        assert!(!manager.process_at(detection(RuleId::SuidWritablePath, 1000, "/tmp/a"), t0, wall));
    }

    #[test]
    fn test_dedup_key_includes_comm_for_rule05() {
        let manager = AlertManager::new(1000, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        let mut insmod = detection(RuleId::KernelModuleAbuse, 1000, "");
        insmod.event.comm = "insmod".to_string();
        let mut modprobe = detection(RuleId::KernelModuleAbuse, 1000, "");
        modprobe.event.comm = "modprobe".to_string();

        assert!(manager.process_at(insmod.clone(), t0, wall));
        assert!(manager.process_at(modprobe, t0, wall));
        assert!(!manager.process_at(insmod, t0, wall));
    }

    #[test]
    fn test_rate_limit_caps_sliding_window() {
        let manager = AlertManager::new(30, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        // 40 distinct uids inside 30 seconds: 30 pass, 10 rate-dropped.
        for uid in 0..40 {
            let at = t0 + Duration::from_millis(uid as u64 * 750);
            manager.process_at(detection(RuleId::UidToRoot, 1000 + uid, ""), at, wall);
        }
        assert_eq!(manager.generated(), 30);
        assert_eq!(manager.dropped(), 10);
    }

    #[test]
    fn test_rate_limit_window_slides() {
        let manager = AlertManager::new(2, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        assert!(manager.process_at(detection(RuleId::UidToRoot, 1000, ""), t0, wall));
        assert!(manager.process_at(detection(RuleId::UidToRoot, 1001, ""), t0, wall));
        assert!(!manager.process_at(detection(RuleId::UidToRoot, 1002, ""), t0, wall));
        // After the old entries age out the budget is back.
        assert!(manager.process_at(
            detection(RuleId::UidToRoot, 1003, ""),
            t0 + Duration::from_secs(61),
            wall
        ));
    }

    #[test]
    fn test_dedup_cache_sweeps_aged_entries() {
        let manager = AlertManager::new(100_000, None);
        let t0 = Instant::now();
        let wall = Utc::now();

        for uid in 0..501 {
            manager.process_at(detection(RuleId::UidToRoot, uid, ""), t0, wall);
        }
        // All fresh: sweep keeps them, cache stays above the cap.
        assert!(manager.state.lock().dedup.len() > DEDUP_CACHE_MAX);

        // One more insert past the window sweeps the aged batch out.
        manager.process_at(
            detection(RuleId::UidToRoot, 9999, ""),
            t0 + Duration::from_secs(700),
            wall,
        );
        assert_eq!(manager.state.lock().dedup.len(), 1);
    }

    #[test]
    fn test_subscribers_receive_normalized_alerts() {
        let manager = AlertManager::new(1000, None);
        let (tx, rx) = crossbeam_channel::unbounded();
        manager.add_subscriber(tx);

        manager.process(detection(RuleId::UidToRoot, 1000, ""));
        let record = rx.try_recv().unwrap();
        assert_eq!(record.rule_id, "RULE-01");
        assert_eq!(record.rule_name, "Direct UID to Root");
        assert_eq!(record.severity, Severity::Critical);
        assert!(!record.acknowledged);
        assert!(!record.forwarded);
        assert!(!record.alert_id.is_empty());
    }

    #[test]
    fn test_disconnected_subscriber_does_not_block_others() {
        let manager = AlertManager::new(1000, None);
        let (dead_tx, dead_rx) = crossbeam_channel::unbounded();
        drop(dead_rx);
        let (tx, rx) = crossbeam_channel::unbounded();
        manager.add_subscriber(dead_tx);
        manager.add_subscriber(tx);

        assert!(manager.process(detection(RuleId::UidToRoot, 1000, "")));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_confidence_rounded_to_three_decimals() {
        let wall = Utc::now();
        let mut d = detection(RuleId::UidToRoot, 1000, "");
        d.confidence = 0.98765;
        let record = normalize(d, wall);
        assert_eq!(record.confidence, 0.988);
    }

    #[test]
    fn test_severity_roundtrip() {
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(severity.as_str().parse::<Severity>(), Ok(severity));
        }
        assert!("bogus".parse::<Severity>().is_err());
    }
}
