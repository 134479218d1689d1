//! Forwarder configuration file.
//!
//! JSON, written with mode 0600 because it carries the collector API key.
//! The sync watermark (`last_synced_id`) lives here too, so a restart
//! resumes exactly where the previous run stopped.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use privwatch_shared::errors::{DetectorError, DetectorResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub vercel_url: String,
    pub api_key: String,
    pub machine_name: String,
    #[serde(default)]
    pub last_synced_id: i64,
    #[serde(default)]
    pub last_sync_time: Option<String>,
}

impl ForwarderConfig {
    /// Load the config, `None` when not yet set up.
    pub fn load(path: &Path) -> DetectorResult<Option<ForwarderConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Some(config))
    }

    /// Persist atomically (temp file + rename) with owner-only permissions.
    pub fn save(&self, path: &Path) -> DetectorResult<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| DetectorError::Config(format!("config temp file: {}", e)))?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(path)
            .map_err(|e| DetectorError::Config(format!("persist {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// First characters of the API key, for status output.
    pub fn api_key_prefix(&self) -> String {
        self.api_key.chars().take(10).collect()
    }
}
