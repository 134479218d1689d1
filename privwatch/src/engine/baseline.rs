//! Per-uid baseline store.
//!
//! Records raw observation timestamps per (uid, syscall) and snapshots them
//! to `baseline_<uid>.json` files. The files are the hand-off point to an
//! offline learner; the store itself never computes statistics beyond counts.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use privwatch_shared::errors::{DetectorError, DetectorResult};

type UidData = HashMap<String, Vec<f64>>;

pub struct BaselineStore {
    dir: PathBuf,
    data: Mutex<HashMap<u32, UidData>>,
}

impl BaselineStore {
    /// Open the store, creating the directory and loading any existing
    /// per-uid snapshot files. Unreadable files are skipped with a warning.
    pub fn open(dir: &Path) -> DetectorResult<Self> {
        fs::create_dir_all(dir)?;

        let mut data: HashMap<u32, UidData> = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(uid) = snapshot_uid(&entry.path()) else {
                continue;
            };
            match fs::read_to_string(entry.path())
                .map_err(DetectorError::from)
                .and_then(|raw| serde_json::from_str::<UidData>(&raw).map_err(DetectorError::from))
            {
                Ok(loaded) => {
                    data.insert(uid, loaded);
                }
                Err(e) => warn!("could not load baseline {}: {}", entry.path().display(), e),
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            data: Mutex::new(data),
        })
    }

    /// Record one observation for (uid, syscall) at the current time.
    pub fn record(&self, uid: u32, syscall: &str) {
        let now = unix_now();
        self.data
            .lock()
            .entry(uid)
            .or_default()
            .entry(syscall.to_string())
            .or_default()
            .push(now);
    }

    /// Observation counts per syscall for one uid, `None` when untracked.
    pub fn get_baseline(&self, uid: u32) -> Option<HashMap<String, usize>> {
        let data = self.data.lock();
        let per_uid = data.get(&uid)?;
        if per_uid.is_empty() {
            return None;
        }
        Some(
            per_uid
                .iter()
                .map(|(syscall, stamps)| (syscall.clone(), stamps.len()))
                .collect(),
        )
    }

    /// Snapshot one uid's data to its `baseline_<uid>.json` file.
    ///
    /// The write goes through a temp file in the same directory so readers
    /// never observe a partial snapshot.
    pub fn force_update(&self, uid: u32) -> DetectorResult<()> {
        let snapshot = {
            let data = self.data.lock();
            serde_json::to_vec(data.get(&uid).unwrap_or(&UidData::new()))?
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| DetectorError::Storage(format!("baseline temp file: {}", e)))?;
        tmp.write_all(&snapshot)?;
        tmp.persist(self.snapshot_path(uid))
            .map_err(|e| DetectorError::Storage(format!("baseline snapshot: {}", e)))?;

        info!("baseline saved for uid {}", uid);
        Ok(())
    }

    fn snapshot_path(&self, uid: u32) -> PathBuf {
        self.dir.join(format!("baseline_{}.json", uid))
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parse the uid out of a `baseline_<uid>.json` path.
fn snapshot_uid(path: &Path) -> Option<u32> {
    let stem = path.file_name()?.to_str()?;
    stem.strip_prefix("baseline_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_counts() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();

        assert!(store.get_baseline(1000).is_none());

        store.record(1000, "execve");
        store.record(1000, "execve");
        store.record(1000, "openat");

        let counts = store.get_baseline(1000).unwrap();
        assert_eq!(counts.get("execve"), Some(&2));
        assert_eq!(counts.get("openat"), Some(&1));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();

        {
            let store = BaselineStore::open(dir.path()).unwrap();
            store.record(1000, "setuid");
            store.record(1000, "setuid");
            store.force_update(1000).unwrap();
        }
        assert!(dir.path().join("baseline_1000.json").exists());

        // A fresh store picks the snapshot back up.
        let store = BaselineStore::open(dir.path()).unwrap();
        let counts = store.get_baseline(1000).unwrap();
        assert_eq!(counts.get("setuid"), Some(&2));
    }

    #[test]
    fn test_unreadable_snapshot_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("baseline_1000.json"), b"not json").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"ignored").unwrap();

        let store = BaselineStore::open(dir.path()).unwrap();
        assert!(store.get_baseline(1000).is_none());
    }

    #[test]
    fn test_force_update_for_untracked_uid_writes_empty_map() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.force_update(4242).unwrap();

        let raw = fs::read_to_string(dir.path().join("baseline_4242.json")).unwrap();
        assert_eq!(raw.trim(), "{}");
    }
}
