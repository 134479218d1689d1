//! Detector configuration.
//!
//! Loaded once at startup from a YAML file. Every section has defaults so a
//! minimal config stays minimal; a missing file is fatal.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use privwatch_shared::errors::{DetectorError, DetectorResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_app_version")]
    pub version: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_alerts_per_minute")]
    pub max_alerts_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub anomaly_enabled: bool,
    #[serde(default)]
    pub anomaly_config: AnomalyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub users: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console_enabled: bool,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
    #[serde(default = "default_log_path")]
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Compiled probe object to load.
    #[serde(default = "default_probe_object")]
    pub object: PathBuf,
}

impl Config {
    /// Load and parse the config file. A missing or unparsable file is a
    /// startup-fatal configuration error.
    pub fn load(path: &Path) -> DetectorResult<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Baseline snapshot directory, a sibling of the database directory.
    pub fn baseline_dir(&self) -> PathBuf {
        self.database
            .path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."))
            .join("baselines")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
            debug: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_alerts_per_minute: default_max_alerts_per_minute(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            anomaly_enabled: true,
            anomaly_config: AnomalyConfig::default(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: default_deviation_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console_enabled: true,
            file_enabled: true,
            file_path: default_log_path(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            object: default_probe_object(),
        }
    }
}

fn default_app_name() -> String {
    "privwatch".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/database/detector.db")
}

fn default_queue_size() -> usize {
    1000
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_alerts_per_minute() -> usize {
    30
}

fn default_deviation_threshold() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/detector.log")
}

fn default_probe_object() -> PathBuf {
    PathBuf::from("probe/syscall_monitor.o")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gets_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.performance.queue_size, 1000);
        assert_eq!(config.performance.worker_threads, 2);
        assert_eq!(config.alerts.rate_limit.max_alerts_per_minute, 30);
        assert!(config.detection.anomaly_enabled);
        assert_eq!(config.detection.anomaly_config.deviation_threshold, 2.0);
        assert!(config.whitelist.processes.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config_overrides() {
        let yaml = r#"
app:
  name: detector-lab
performance:
  queue_size: 64
alerts:
  rate_limit:
    max_alerts_per_minute: 5
whitelist:
  processes: [systemd, cron]
  users: [0]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.name, "detector-lab");
        assert_eq!(config.performance.queue_size, 64);
        assert_eq!(config.performance.worker_threads, 2);
        assert_eq!(config.alerts.rate_limit.max_alerts_per_minute, 5);
        assert_eq!(config.whitelist.processes, vec!["systemd", "cron"]);
        assert_eq!(config.whitelist.users, vec![0]);
    }

    #[test]
    fn test_baseline_dir_is_sibling_of_database_dir() {
        let yaml = "database:\n  path: /var/lib/privwatch/database/detector.db\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.baseline_dir(),
            PathBuf::from("/var/lib/privwatch/baselines")
        );
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, DetectorError::Config(_)));
    }
}
