//! Kernel probe binding.
//!
//! Loads the compiled probe object, attaches its tracepoint programs and
//! drains the `EVENTS` ring buffer on a dedicated polling thread. The probe
//! object itself is built out-of-tree; this module only consumes its maps.
//!
//! A host without eBPF support (or without the probe object installed) is a
//! supported configuration: `start` reports [`ProbeStatus::Degraded`] and the
//! detector keeps running without ingest.

pub mod record;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aya::Ebpf;
use aya::maps::{MapData, RingBuf};
use aya::programs::TracePoint;
use tracing::{error, info, warn};

use privwatch_shared::errors::{DetectorError, DetectorResult};
use self::record::Event;

/// Name of the ring buffer map exported by the probe object.
const RING_MAP: &str = "EVENTS";

/// Idle sleep between ring buffer drains.
const POLL_IDLE: Duration = Duration::from_millis(100);

/// Tracepoints the probe object is expected to handle. Program names match
/// the tracepoint names; a probe object may omit some of them.
const TRACEPOINTS: &[&str] = &[
    "sys_enter_setuid",
    "sys_enter_setgid",
    "sys_enter_setreuid",
    "sys_enter_setresuid",
    "sys_enter_execve",
    "sys_enter_openat",
    "sys_enter_fchmodat",
    "sys_enter_capset",
];

/// Outcome of starting the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Ring buffer open, events flowing.
    Active,
    /// Probe unavailable; detector runs without ingest.
    Degraded,
}

/// Userspace handle to the kernel probe.
pub struct Probe {
    object_path: PathBuf,
    running: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    // Keeps programs and links alive while polling.
    ebpf: Option<Ebpf>,
}

impl Probe {
    pub fn new(object_path: &Path) -> Self {
        Self {
            object_path: object_path.to_path_buf(),
            running: Arc::new(AtomicBool::new(false)),
            poller: None,
            ebpf: None,
        }
    }

    /// Load the probe object and start draining its ring buffer.
    ///
    /// Every decoded event is handed to `handler` on the polling thread.
    /// Failure to load or attach is not fatal: the probe reports
    /// [`ProbeStatus::Degraded`] and the caller continues without ingest.
    pub fn start<F>(&mut self, handler: F) -> ProbeStatus
    where
        F: Fn(Event) + Send + 'static,
    {
        let ring = match self.load_and_attach() {
            Ok(ring) => ring,
            Err(e) => {
                warn!("probe unavailable ({}); continuing in degraded mode", e);
                return ProbeStatus::Degraded;
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let poller = thread::Builder::new()
            .name("probe-poll".to_string())
            .spawn(move || poll_loop(ring, running, handler));
        match poller {
            Ok(handle) => {
                self.poller = Some(handle);
                info!("probe ring buffer polling started");
                ProbeStatus::Active
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.ebpf = None;
                warn!("could not spawn probe poller ({}); continuing in degraded mode", e);
                ProbeStatus::Degraded
            }
        }
    }

    /// Stop polling and detach. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        // Dropping the Ebpf handle detaches the tracepoints.
        self.ebpf = None;
    }

    fn load_and_attach(&mut self) -> DetectorResult<RingBuf<MapData>> {
        let mut ebpf = Ebpf::load_file(&self.object_path)
            .map_err(|e| DetectorError::Probe(format!("load {}: {}", self.object_path.display(), e)))?;

        for tp in TRACEPOINTS {
            let Some(program) = ebpf.program_mut(tp) else {
                warn!("probe object has no program for {}", tp);
                continue;
            };
            let program: &mut TracePoint = program
                .try_into()
                .map_err(|e| DetectorError::Probe(format!("{}: {}", tp, e)))?;
            program
                .load()
                .map_err(|e| DetectorError::Probe(format!("load {}: {}", tp, e)))?;
            program
                .attach("syscalls", tp)
                .map_err(|e| DetectorError::Probe(format!("attach {}: {}", tp, e)))?;
        }

        let map = ebpf
            .take_map(RING_MAP)
            .ok_or_else(|| DetectorError::Probe(format!("probe object has no {} map", RING_MAP)))?;
        let ring = RingBuf::try_from(map)
            .map_err(|e| DetectorError::Probe(format!("{}: {}", RING_MAP, e)))?;

        self.ebpf = Some(ebpf);
        Ok(ring)
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop<F>(mut ring: RingBuf<MapData>, running: Arc<AtomicBool>, handler: F)
where
    F: Fn(Event),
{
    while running.load(Ordering::Relaxed) {
        let mut drained = false;
        while let Some(item) = ring.next() {
            drained = true;
            match Event::parse(&item) {
                Ok(event) => handler(event),
                // Malformed record: skip it, keep the stream alive.
                Err(e) => error!("{}", e),
            }
            if !running.load(Ordering::Relaxed) {
                return;
            }
        }
        if !drained {
            thread::sleep(POLL_IDLE);
        }
    }
}
