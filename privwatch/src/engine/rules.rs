//! Escalation detection rules.
//!
//! Ten rules run against every event, in a fixed order. RULES 01-09 are
//! per-event checks; each one that fires also registers an escalation signal
//! for the event's pid. RULE-10 fires when a pid has accumulated two or more
//! distinct signals inside the correlation window.
//!
//! All correlation state (signals, first-signal times, the capset cache)
//! lives behind one mutex so that concurrent workers never race a lookup
//! against an update for the same pid.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::engine::alert::Severity;
use crate::probe::record::{Event, Syscall};

/// How long escalation signals for a pid stay correlatable.
pub const CORRELATION_WINDOW: Duration = Duration::from_secs(15);

/// capset must be followed by a root exec within this window for RULE-08.
const CAPSET_WINDOW: Duration = Duration::from_secs(5);

/// First uid of the unprivileged user range.
const UNPRIVILEGED_UID_MIN: u32 = 1000;

/// Mask isolating the open(2) access mode (O_RDONLY/O_WRONLY/O_RDWR).
const OPEN_ACCMODE: u32 = 3;

const CREDENTIAL_FILES: &[&str] = &["/etc/shadow", "/etc/gshadow"];
const SUDOERS_FILE: &str = "/etc/sudoers";
const DOCKER_SOCKETS: &[&str] = &["/var/run/docker.sock", "/run/docker.sock"];
const WRITABLE_PATHS: &[&str] = &["/tmp/", "/dev/shm/", "/var/tmp/"];
const KERNEL_TOOLS: &[&str] = &["insmod", "modprobe", "rmmod"];

// Processes that legitimately touch sensitive files.
const SETUID_EXEMPT: &[&str] = &[
    "sudo", "su", "pkexec", "newgrp", "passwd", "gdbus", "vmtoolsd", "polkit", "dbus-daemon",
];
const SAFE_SHADOW: &[&str] = &[
    "passwd", "chpasswd", "chage", "useradd", "usermod", "shadow", "unix_chkpwd", "sudo", "su",
];
const SAFE_SSH: &[&str] = &["sshd", "ssh-keygen", "ssh-keyscan"];
const SAFE_DOCKER: &[&str] = &["dockerd", "containerd", "docker", "dockerd-current"];
const SAFE_SUDOERS: &[&str] = &["visudo", "dpkg", "apt", "apt-get", "ansible", "sudo"];

/// Identity of a detection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleId {
    UidToRoot,
    ShadowTamper,
    SshKeyInjection,
    ProcMemWrite,
    KernelModuleAbuse,
    DockerSocketAbuse,
    SuidWritablePath,
    CapabilityAbuse,
    SudoersTamper,
    CorrelatedEscalation,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::UidToRoot => "RULE-01",
            RuleId::ShadowTamper => "RULE-02",
            RuleId::SshKeyInjection => "RULE-03",
            RuleId::ProcMemWrite => "RULE-04",
            RuleId::KernelModuleAbuse => "RULE-05",
            RuleId::DockerSocketAbuse => "RULE-06",
            RuleId::SuidWritablePath => "RULE-07",
            RuleId::CapabilityAbuse => "RULE-08",
            RuleId::SudoersTamper => "RULE-09",
            RuleId::CorrelatedEscalation => "RULE-10",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuleId::UidToRoot => "Direct UID to Root",
            RuleId::ShadowTamper => "Shadow File Tampered",
            RuleId::SshKeyInjection => "Root SSH Key Injection",
            RuleId::ProcMemWrite => "Process Memory Injection",
            RuleId::KernelModuleAbuse => "Kernel Module Abuse",
            RuleId::DockerSocketAbuse => "Docker Socket Abuse",
            RuleId::SuidWritablePath => "SUID from Writable Path",
            RuleId::CapabilityAbuse => "Capability Abuse",
            RuleId::SudoersTamper => "Sudoers Tampering",
            RuleId::CorrelatedEscalation => "Confirmed Privilege Escalation",
        }
    }

    /// Every current rule is CRITICAL.
    pub fn severity(&self) -> Severity {
        Severity::Critical
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Escalation signal registered by RULES 01-09 for a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalTag {
    SetuidRoot,
    Shadow,
    Ssh,
    ProcMem,
    Kernel,
    Docker,
    SuidTmp,
    Capset,
    Sudoers,
}

impl SignalTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalTag::SetuidRoot => "setuid_root",
            SignalTag::Shadow => "shadow",
            SignalTag::Ssh => "ssh",
            SignalTag::ProcMem => "proc_mem",
            SignalTag::Kernel => "kernel",
            SignalTag::Docker => "docker",
            SignalTag::SuidTmp => "suid_tmp",
            SignalTag::Capset => "capset",
            SignalTag::Sudoers => "sudoers",
        }
    }
}

/// One rule match, not yet an alert.
///
/// The alert manager normalizes detections into persisted alert records.
#[derive(Debug, Clone)]
pub struct Detection {
    pub rule: RuleId,
    pub confidence: f64,
    pub description: String,
    pub event: Event,
}

#[derive(Default)]
struct TrackerState {
    /// Distinct signals per pid. Ordered so RULE-10 descriptions are stable.
    signals: HashMap<u32, BTreeSet<SignalTag>>,
    /// Time of the first signal per pid.
    first_signal: HashMap<u32, Instant>,
    /// pid -> time of the last unprivileged capset (RULE-08).
    capset_seen: HashMap<u32, Instant>,
}

impl TrackerState {
    fn register(&mut self, pid: u32, tag: SignalTag, now: Instant) {
        self.first_signal.entry(pid).or_insert(now);
        self.signals.entry(pid).or_default().insert(tag);
    }
}

/// Stateless rule checks plus the stateful correlator.
pub struct RuleEngine {
    state: Mutex<TrackerState>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Evaluate all rules against one event.
    pub fn check_event(&self, event: &Event) -> Vec<Detection> {
        self.check_event_at(event, Instant::now())
    }

    /// Evaluate with an explicit clock, for deterministic tests.
    pub fn check_event_at(&self, event: &Event, now: Instant) -> Vec<Detection> {
        let mut detections = Vec::new();
        let mut state = self.state.lock();

        let pid = event.pid;
        let uid = event.uid;
        let euid = event.euid;
        let comm = event.comm.as_str();
        let path = event.filename.as_str();
        let flags = event.open_flags;
        let syscall = event.syscall;

        let unprivileged = uid >= UNPRIVILEGED_UID_MIN;
        let writes = flags & OPEN_ACCMODE != 0;

        // RULE-01: non-root process switching its uid to root
        if matches!(syscall, Syscall::Setuid | Syscall::Setreuid | Syscall::Setresuid)
            && unprivileged
            && event.new_uid == 0
            && !SETUID_EXEMPT.contains(&comm)
        {
            detections.push(Detection {
                rule: RuleId::UidToRoot,
                confidence: 0.99,
                description: format!("UID {} -> root via {} (PID {}, {})", uid, syscall, pid, comm),
                event: event.clone(),
            });
            state.register(pid, SignalTag::SetuidRoot, now);
        }

        // RULE-02: shadow/gshadow opened for writing by an unexpected process
        if matches!(syscall, Syscall::Openat | Syscall::Chmod)
            && CREDENTIAL_FILES.contains(&path)
            && !SAFE_SHADOW.contains(&comm)
            && matches!(flags & OPEN_ACCMODE, 1 | 2)
        {
            detections.push(Detection {
                rule: RuleId::ShadowTamper,
                confidence: 0.99,
                description: format!("{} modified by {} (UID {}, PID {})", path, comm, uid, pid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::Shadow, now);
        }

        // RULE-03: root SSH key material touched
        if syscall == Syscall::Openat && path.contains("/root/.ssh/") && !SAFE_SSH.contains(&comm) {
            detections.push(Detection {
                rule: RuleId::SshKeyInjection,
                confidence: 0.99,
                description: format!("Root SSH file accessed: {} by {} (UID {})", path, comm, uid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::Ssh, now);
        }

        // RULE-04: /proc/<pid>/mem opened writable
        if syscall == Syscall::Openat && is_proc_mem(path) && writes {
            detections.push(Detection {
                rule: RuleId::ProcMemWrite,
                confidence: 0.99,
                description: format!("Write to {} by {} (UID {})", path, comm, uid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::ProcMem, now);
        }

        // RULE-05: kernel module tooling run by an unprivileged user
        if matches!(syscall, Syscall::Execve | Syscall::Openat)
            && KERNEL_TOOLS.contains(&comm)
            && unprivileged
        {
            detections.push(Detection {
                rule: RuleId::KernelModuleAbuse,
                confidence: 0.99,
                description: format!("{} executed by UID {} (PID {})", comm, uid, pid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::Kernel, now);
        }

        // RULE-06: docker socket touched by an unexpected process
        if syscall == Syscall::Openat && DOCKER_SOCKETS.contains(&path) && !SAFE_DOCKER.contains(&comm)
        {
            detections.push(Detection {
                rule: RuleId::DockerSocketAbuse,
                confidence: 0.99,
                description: format!("Docker socket accessed by {} (UID {})", comm, uid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::Docker, now);
        }

        // RULE-07: root exec out of a world-writable path
        if syscall == Syscall::Execve
            && euid == 0
            && unprivileged
            && WRITABLE_PATHS.iter().any(|p| path.starts_with(p))
        {
            detections.push(Detection {
                rule: RuleId::SuidWritablePath,
                confidence: 0.99,
                description: format!("Root exec from {} (UID {}, PID {})", path, uid, pid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::SuidTmp, now);
        }

        // RULE-08: capset followed by a root exec from the same pid within 5s
        if syscall == Syscall::Capset && unprivileged {
            state.capset_seen.insert(pid, now);
        }
        if syscall == Syscall::Execve && euid == 0 {
            if let Some(&capset_at) = state.capset_seen.get(&pid) {
                if now.duration_since(capset_at) < CAPSET_WINDOW {
                    detections.push(Detection {
                        rule: RuleId::CapabilityAbuse,
                        confidence: 0.99,
                        description: format!("capset -> root exec: {} (PID {})", comm, pid),
                        event: event.clone(),
                    });
                    state.register(pid, SignalTag::Capset, now);
                }
                // Hit or expired, the entry is spent either way.
                state.capset_seen.remove(&pid);
            }
        }

        // RULE-09: sudoers touched by an unexpected process
        if matches!(syscall, Syscall::Openat | Syscall::Chmod)
            && path == SUDOERS_FILE
            && !SAFE_SUDOERS.contains(&comm)
        {
            detections.push(Detection {
                rule: RuleId::SudoersTamper,
                confidence: 0.99,
                description: format!("/etc/sudoers modified by {} (UID {}, PID {})", comm, uid, pid),
                event: event.clone(),
            });
            state.register(pid, SignalTag::Sudoers, now);
        }

        // RULE-10: two or more distinct signals for this pid in the window.
        // Signals are deliberately not cleared after a hit, so a pid keeps
        // confirming as long as its signals stay inside the window.
        if !detections.is_empty() {
            if let Some(correlated) = confirmed_escalation(&mut state, event, now) {
                detections.push(correlated);
            }
        }

        detections
    }

    /// Number of pids currently tracked by the correlator.
    pub fn tracked_pids(&self) -> usize {
        self.state.lock().first_signal.len()
    }
}

/// RULE-10 check. Purges the pid's state lazily when it has aged out.
fn confirmed_escalation(state: &mut TrackerState, event: &Event, now: Instant) -> Option<Detection> {
    let pid = event.pid;
    let first = *state.first_signal.get(&pid)?;
    if now.duration_since(first) > CORRELATION_WINDOW {
        state.signals.remove(&pid);
        state.first_signal.remove(&pid);
        return None;
    }
    let signals = state.signals.get(&pid)?;
    if signals.len() < 2 {
        return None;
    }
    let tags: Vec<&str> = signals.iter().map(|t| t.as_str()).collect();
    Some(Detection {
        rule: RuleId::CorrelatedEscalation,
        confidence: 0.99,
        description: format!("Multiple escalation signals: {}", tags.join(", ")),
        event: event.clone(),
    })
}

/// True for paths of exactly the shape `/proc/<digits>/mem`.
fn is_proc_mem(path: &str) -> bool {
    let mut parts = path.trim_matches('/').split('/');
    let (Some(first), Some(pid), Some(last), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    first == "proc" && last == "mem" && !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit())
}
