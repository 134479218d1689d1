//! Fixed-layout decoding of kernel probe records.
//!
//! The probe emits one packed record per captured syscall. Integers are
//! native-endian, character fields are NUL-padded. `open_flags` rides as a
//! trailing u32 of the extended record so the openat/chmod rules can see the
//! access mode.

use privwatch_shared::errors::{DetectorError, DetectorResult};

const COMM_LEN: usize = 16;
const FILENAME_LEN: usize = 256;
const SYSCALL_NAME_LEN: usize = 32;

/// Total size of one probe record in bytes.
///
/// Layout: 7x u32 ids, u64 timestamp, u32 event_type, comm[16],
/// parent_comm[16], filename[256], syscall_name[32], u32 open_flags.
pub const RECORD_SIZE: usize = 7 * 4 + 8 + 4 + COMM_LEN + COMM_LEN + FILENAME_LEN + SYSCALL_NAME_LEN + 4;

/// Syscall captured by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Syscall {
    Setuid,
    Execve,
    Openat,
    Chmod,
    Capset,
    Setgid,
    Setreuid,
    Setresuid,
}

impl Syscall {
    /// Map the probe's numeric event type to a syscall.
    pub fn from_event_type(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Syscall::Setuid),
            2 => Some(Syscall::Execve),
            3 => Some(Syscall::Openat),
            4 => Some(Syscall::Chmod),
            5 => Some(Syscall::Capset),
            6 => Some(Syscall::Setgid),
            7 => Some(Syscall::Setreuid),
            8 => Some(Syscall::Setresuid),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "setuid" => Some(Syscall::Setuid),
            "execve" => Some(Syscall::Execve),
            "openat" => Some(Syscall::Openat),
            "chmod" => Some(Syscall::Chmod),
            "capset" => Some(Syscall::Capset),
            "setgid" => Some(Syscall::Setgid),
            "setreuid" => Some(Syscall::Setreuid),
            "setresuid" => Some(Syscall::Setresuid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Syscall::Setuid => "setuid",
            Syscall::Execve => "execve",
            Syscall::Openat => "openat",
            Syscall::Chmod => "chmod",
            Syscall::Capset => "capset",
            Syscall::Setgid => "setgid",
            Syscall::Setreuid => "setreuid",
            Syscall::Setresuid => "setresuid",
        }
    }
}

impl std::fmt::Display for Syscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One decoded probe event.
///
/// Immutable once decoded; workers pass it by reference through the rule
/// engine and clone the fields an alert carries.
#[derive(Debug, Clone)]
pub struct Event {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub new_uid: u32,
    pub new_gid: u32,
    /// Monotonic nanoseconds from the probe.
    pub timestamp: u64,
    pub syscall: Syscall,
    pub comm: String,
    pub parent_comm: String,
    pub filename: String,
    pub open_flags: u32,
}

impl Event {
    /// Decode a packed probe record.
    ///
    /// Character fields are decoded as UTF-8 with replacement on invalid
    /// bytes. An empty `syscall_name` falls back to the numeric event type.
    pub fn parse(buf: &[u8]) -> DetectorResult<Event> {
        if buf.len() < RECORD_SIZE {
            return Err(DetectorError::Decode(format!(
                "record too short: {} bytes, expected {}",
                buf.len(),
                RECORD_SIZE
            )));
        }

        let event_type = read_u32(buf, 36);
        let name = read_cstr(buf, 328, SYSCALL_NAME_LEN);
        let syscall = if name.is_empty() {
            Syscall::from_event_type(event_type)
        } else {
            Syscall::from_name(&name)
        }
        .ok_or_else(|| {
            DetectorError::Decode(format!(
                "unknown syscall: name={:?} event_type={}",
                name, event_type
            ))
        })?;

        Ok(Event {
            pid: read_u32(buf, 0),
            ppid: read_u32(buf, 4),
            uid: read_u32(buf, 8),
            euid: read_u32(buf, 12),
            gid: read_u32(buf, 16),
            new_uid: read_u32(buf, 20),
            new_gid: read_u32(buf, 24),
            timestamp: read_u64(buf, 28),
            syscall,
            comm: read_cstr(buf, 40, COMM_LEN),
            parent_comm: read_cstr(buf, 56, COMM_LEN),
            filename: read_cstr(buf, 72, FILENAME_LEN),
            open_flags: read_u32(buf, 360),
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

/// Decode a NUL-terminated field, lossy on invalid UTF-8.
fn read_cstr(buf: &[u8], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_str(buf: &mut [u8], offset: usize, value: &[u8]) {
        buf[offset..offset + value.len()].copy_from_slice(value);
    }

    fn raw_record() -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        put_u32(&mut buf, 0, 42); // pid
        put_u32(&mut buf, 4, 1); // ppid
        put_u32(&mut buf, 8, 1000); // uid
        put_u32(&mut buf, 12, 1000); // euid
        put_u32(&mut buf, 16, 1000); // gid
        put_u32(&mut buf, 20, 0); // new_uid
        put_u32(&mut buf, 24, 0); // new_gid
        put_u64(&mut buf, 28, 987654321); // timestamp
        put_u32(&mut buf, 36, 1); // event_type = setuid
        put_str(&mut buf, 40, b"myapp\0");
        put_str(&mut buf, 56, b"bash\0");
        put_str(&mut buf, 72, b"\0");
        put_str(&mut buf, 328, b"setuid\0");
        put_u32(&mut buf, 360, 0); // open_flags
        buf
    }

    #[test]
    fn test_parse_full_record() {
        let event = Event::parse(&raw_record()).unwrap();
        assert_eq!(event.pid, 42);
        assert_eq!(event.ppid, 1);
        assert_eq!(event.uid, 1000);
        assert_eq!(event.new_uid, 0);
        assert_eq!(event.timestamp, 987654321);
        assert_eq!(event.syscall, Syscall::Setuid);
        assert_eq!(event.comm, "myapp");
        assert_eq!(event.parent_comm, "bash");
        assert!(event.filename.is_empty());
    }

    #[test]
    fn test_parse_derives_syscall_from_event_type() {
        let mut buf = raw_record();
        // blank out syscall_name, leave event_type = 3 (openat)
        buf[328..328 + 32].fill(0);
        put_u32(&mut buf, 36, 3);
        let event = Event::parse(&buf).unwrap();
        assert_eq!(event.syscall, Syscall::Openat);
    }

    #[test]
    fn test_parse_rejects_short_record() {
        let buf = vec![0u8; RECORD_SIZE - 1];
        assert!(Event::parse(&buf).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_event_type() {
        let mut buf = raw_record();
        buf[328..328 + 32].fill(0);
        put_u32(&mut buf, 36, 99);
        assert!(Event::parse(&buf).is_err());
    }

    #[test]
    fn test_parse_lossy_utf8_comm() {
        let mut buf = raw_record();
        put_str(&mut buf, 40, b"bad\xff\xfe\0");
        let event = Event::parse(&buf).unwrap();
        assert!(event.comm.starts_with("bad"));
    }

    #[test]
    fn test_parse_carries_open_flags() {
        let mut buf = raw_record();
        put_u32(&mut buf, 36, 3);
        put_str(&mut buf, 328, b"openat\0");
        put_str(&mut buf, 72, b"/etc/shadow\0");
        put_u32(&mut buf, 360, 2); // O_RDWR
        let event = Event::parse(&buf).unwrap();
        assert_eq!(event.filename, "/etc/shadow");
        assert_eq!(event.open_flags, 2);
    }

    #[test]
    fn test_syscall_name_table_is_total() {
        for raw in 1..=8 {
            let syscall = Syscall::from_event_type(raw).unwrap();
            assert_eq!(Syscall::from_name(syscall.as_str()), Some(syscall));
        }
        assert_eq!(Syscall::from_event_type(0), None);
        assert_eq!(Syscall::from_event_type(9), None);
    }
}
