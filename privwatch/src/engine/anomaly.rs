//! Statistical anomaly detection against per-identity baselines.
//!
//! Counts syscalls per (uid, syscall) and compares against a known baseline
//! mean. Anomalies are informational: they feed subscribers and a counter,
//! not the alert pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;

use crate::probe::record::{Event, Syscall};

/// Baseline statistics for one (uid, syscall) pair.
#[derive(Debug, Clone, Copy)]
pub struct Baseline {
    pub mean: f64,
    /// Standard deviation; `None` or zero falls back to `mean / 2`.
    pub std: Option<f64>,
}

impl Baseline {
    fn effective_std(&self) -> f64 {
        match self.std {
            Some(std) if std > 0.0 => std,
            _ => self.mean * 0.5,
        }
    }
}

/// Emitted when a counter exceeds its baseline envelope.
#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub uid: u32,
    pub syscall: Syscall,
    pub count: u64,
    pub mean: f64,
    pub event: Event,
}

#[derive(Default)]
struct AnomalyState {
    counts: HashMap<u32, HashMap<Syscall, u64>>,
    baselines: HashMap<(u32, Syscall), Baseline>,
}

pub struct AnomalyDetector {
    deviation_threshold: f64,
    state: Mutex<AnomalyState>,
    subscribers: Mutex<Vec<Sender<AnomalyEvent>>>,
    detected: AtomicU64,
}

impl AnomalyDetector {
    pub fn new(deviation_threshold: f64) -> Self {
        Self {
            deviation_threshold,
            state: Mutex::new(AnomalyState::default()),
            subscribers: Mutex::new(Vec::new()),
            detected: AtomicU64::new(0),
        }
    }

    pub fn add_subscriber(&self, tx: Sender<AnomalyEvent>) {
        self.subscribers.lock().push(tx);
    }

    /// Install or replace the baseline for a (uid, syscall) pair.
    ///
    /// Integration point for an external learner; nothing in the detector
    /// updates baselines on its own.
    pub fn set_baseline(&self, uid: u32, syscall: Syscall, mean: f64, std: Option<f64>) {
        self.state
            .lock()
            .baselines
            .insert((uid, syscall), Baseline { mean, std });
    }

    /// Count one event and emit an anomaly when the count leaves the
    /// baseline envelope (`mean + threshold * std`).
    pub fn process(&self, event: &Event) {
        let anomaly = {
            let mut state = self.state.lock();
            let counter = state
                .counts
                .entry(event.uid)
                .or_default()
                .entry(event.syscall)
                .or_insert(0);
            *counter += 1;
            let count = *counter;

            match state.baselines.get(&(event.uid, event.syscall)) {
                Some(baseline) if baseline.mean > 0.0 => {
                    let ceiling = baseline.mean + self.deviation_threshold * baseline.effective_std();
                    (count as f64 > ceiling).then(|| AnomalyEvent {
                        uid: event.uid,
                        syscall: event.syscall,
                        count,
                        mean: baseline.mean,
                        event: event.clone(),
                    })
                }
                _ => None,
            }
        };

        if let Some(anomaly) = anomaly {
            self.detected.fetch_add(1, Ordering::Relaxed);
            let subscribers = self.subscribers.lock();
            for tx in subscribers.iter() {
                if tx.send(anomaly.clone()).is_err() {
                    debug!("anomaly subscriber disconnected");
                }
            }
        }
    }

    pub fn detected(&self) -> u64 {
        self.detected.load(Ordering::Relaxed)
    }
}
