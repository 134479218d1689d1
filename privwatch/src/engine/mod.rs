//! Detection engine.
//!
//! Wires the probe into a bounded work queue drained by a fixed pool of
//! worker threads. Each worker runs the whitelist filter, the rule engine,
//! the alert manager and the anomaly detector against every event.
//!
//! Backpressure policy is drop-newest: when the queue is full the probe
//! thread never blocks, the event is counted in `events_dropped` and lost.

pub mod alert;
pub mod anomaly;
pub mod baseline;
pub mod rules;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{info, warn};

use privwatch_shared::errors::DetectorResult;

use crate::config::Config;
use crate::db::AlertStore;
use crate::probe::{Probe, ProbeStatus};
use crate::probe::record::Event;
use self::alert::AlertManager;
use self::anomaly::AnomalyDetector;
use self::baseline::BaselineStore;
use self::rules::RuleEngine;

/// How long a shutting-down worker gets before being abandoned.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Idle dequeue timeout; bounds the shutdown-check latency of workers.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

enum WorkItem {
    Event(Event),
    Shutdown,
}

/// Counters and derived figures for one engine run.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub rules_triggered: u64,
    pub alerts_generated: u64,
    pub alerts_dropped: u64,
    pub anomalies_detected: u64,
    pub runtime_seconds: u64,
    pub events_per_second: f64,
    pub queue_len: usize,
}

/// Shared state the workers and the probe callback operate on.
struct EngineCore {
    running: AtomicBool,
    rules: RuleEngine,
    alerts: AlertManager,
    anomaly: AnomalyDetector,
    baseline: BaselineStore,
    wl_procs: HashSet<String>,
    wl_users: HashSet<u32>,
    anomaly_enabled: bool,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
    rules_triggered: AtomicU64,
}

impl EngineCore {
    /// Run one event through the pipeline: whitelist, rules, anomaly.
    fn process(&self, event: Event) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        if self.wl_procs.contains(&event.comm) || self.wl_users.contains(&event.uid) {
            return;
        }

        for detection in self.rules.check_event(&event) {
            self.rules_triggered.fetch_add(1, Ordering::Relaxed);
            self.alerts.process(detection);
        }

        if self.anomaly_enabled {
            self.baseline.record(event.uid, event.syscall.as_str());
            self.anomaly.process(&event);
        }
    }
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// The detection engine: queue, workers and probe lifecycle.
pub struct DetectionEngine {
    core: Arc<EngineCore>,
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    worker_threads: usize,
    probe: Mutex<Probe>,
    workers: Mutex<Vec<WorkerHandle>>,
    started_at: Mutex<Option<Instant>>,
}

impl DetectionEngine {
    /// Build an engine from config. Pass `None` for the store to run without
    /// persistence (alerts still reach subscribers).
    pub fn new(config: &Config, store: Option<AlertStore>) -> DetectorResult<Self> {
        let (tx, rx) = bounded(config.performance.queue_size);

        let core = EngineCore {
            running: AtomicBool::new(false),
            rules: RuleEngine::new(),
            alerts: AlertManager::new(config.alerts.rate_limit.max_alerts_per_minute, store),
            anomaly: AnomalyDetector::new(config.detection.anomaly_config.deviation_threshold),
            baseline: BaselineStore::open(&config.baseline_dir())?,
            wl_procs: config.whitelist.processes.iter().cloned().collect(),
            wl_users: config.whitelist.users.iter().copied().collect(),
            anomaly_enabled: config.detection.anomaly_enabled,
            events_processed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            rules_triggered: AtomicU64::new(0),
        };

        Ok(Self {
            core: Arc::new(core),
            tx,
            rx,
            worker_threads: config.performance.worker_threads.max(1),
            probe: Mutex::new(Probe::new(&config.probe.object)),
            workers: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        })
    }

    /// Start workers and the probe. Returns the probe status; a degraded
    /// probe leaves the engine serving its API without ingest.
    pub fn start(&self) -> ProbeStatus {
        self.core.running.store(true, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());

        let mut workers = self.workers.lock();
        for i in 0..self.worker_threads {
            let core = self.core.clone();
            let rx = self.rx.clone();
            let (done_tx, done_rx) = bounded(1);
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    worker_loop(core, rx);
                    let _ = done_tx.send(());
                });
            match spawned {
                Ok(handle) => workers.push(WorkerHandle {
                    handle,
                    done: done_rx,
                }),
                Err(e) => warn!("could not spawn worker-{}: {}", i, e),
            }
        }
        drop(workers);

        let tx = self.tx.clone();
        let core = self.core.clone();
        let status = self.probe.lock().start(move |event| {
            if tx.try_send(WorkItem::Event(event)).is_err() {
                core.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
        if status == ProbeStatus::Degraded {
            warn!("probe unavailable, detector running in limited mode");
        }

        info!("detection engine started ({} workers)", self.worker_threads);
        status
    }

    /// Stop the probe, drain the workers, abandon any that fail to stop in
    /// time. Idempotent.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.probe.lock().stop();

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.tx.send_timeout(WorkItem::Shutdown, DEQUEUE_TIMEOUT);
        }
        for worker in workers.drain(..) {
            match worker.done.recv_timeout(WORKER_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Dropping the handle detaches the thread.
                    warn!("worker did not stop within {:?}, abandoning", WORKER_JOIN_TIMEOUT);
                }
            }
        }
        info!("detection engine stopped");
    }

    /// Enqueue one event, dropping it (counted) when the queue is full.
    ///
    /// Same path the probe callback uses; exposed for local event sources.
    pub fn enqueue(&self, event: Event) -> bool {
        if self.tx.try_send(WorkItem::Event(event)).is_err() {
            self.core.events_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn stats(&self) -> EngineStats {
        let runtime = match *self.started_at.lock() {
            Some(started) => started.elapsed().as_secs(),
            None => 0,
        };
        let processed = self.core.events_processed.load(Ordering::Relaxed);
        let per_second = processed as f64 / runtime.max(1) as f64;

        EngineStats {
            events_processed: processed,
            events_dropped: self.core.events_dropped.load(Ordering::Relaxed),
            rules_triggered: self.core.rules_triggered.load(Ordering::Relaxed),
            alerts_generated: self.core.alerts.generated(),
            alerts_dropped: self.core.alerts.dropped(),
            anomalies_detected: self.core.anomaly.detected(),
            runtime_seconds: runtime,
            events_per_second: (per_second * 100.0).round() / 100.0,
            queue_len: self.tx.len(),
        }
    }

    pub fn alert_manager(&self) -> &AlertManager {
        &self.core.alerts
    }

    pub fn anomaly_detector(&self) -> &AnomalyDetector {
        &self.core.anomaly
    }

    pub fn baseline_store(&self) -> &BaselineStore {
        &self.core.baseline
    }

    pub fn rule_engine(&self) -> &RuleEngine {
        &self.core.rules
    }
}

fn worker_loop(core: Arc<EngineCore>, rx: Receiver<WorkItem>) {
    loop {
        match rx.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(WorkItem::Event(event)) => core.process(event),
            Ok(WorkItem::Shutdown) => break,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !core.running.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
}
