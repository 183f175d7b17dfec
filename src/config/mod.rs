use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Complete statelog configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatelogConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Which EventStore backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// SQLite database file (ignored by the memory backend)
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_db_path() -> PathBuf {
    PathBuf::from("statelog.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
        }
    }
}

/// Which events become records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Every event is appended, including same-value refreshes
    AllEvents,
    /// Events repeating the entity's last recorded state are skipped
    StateChanges,
}

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_record_policy")]
    pub record_policy: RecordPolicy,
    /// Total append attempts per record before it is logged as lost
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Default timeout for `block_till_done`; absent waits forever
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: Option<u64>,
}

fn default_record_policy() -> RecordPolicy {
    RecordPolicy::AllEvents
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_drain_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_policy: default_record_policy(),
            max_write_attempts: default_max_write_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl RecorderConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl StatelogConfig {
    /// Override file settings from STATELOG_* env vars.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STATELOG_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STATELOG_STORE_BACKEND") {
            match v.as_str() {
                "sqlite" => self.store.backend = StoreBackend::Sqlite,
                "memory" => self.store.backend = StoreBackend::Memory,
                other => warn!(value = %other, "Ignoring unknown STATELOG_STORE_BACKEND"),
            }
        }
        if let Ok(v) = std::env::var("STATELOG_DRAIN_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(0) => self.recorder.drain_timeout_secs = None,
                Ok(n) => self.recorder.drain_timeout_secs = Some(n),
                Err(_) => warn!(value = %v, "Ignoring invalid STATELOG_DRAIN_TIMEOUT_SECS"),
            }
        }
        if let Ok(v) = std::env::var("STATELOG_RECORD_POLICY") {
            match v.as_str() {
                "all_events" => self.recorder.record_policy = RecordPolicy::AllEvents,
                "state_changes" => self.recorder.record_policy = RecordPolicy::StateChanges,
                other => warn!(value = %other, "Ignoring unknown STATELOG_RECORD_POLICY"),
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> Result<StatelogConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: StatelogConfig =
        toml::from_str(&contents).context("Failed to parse config TOML")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StatelogConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, PathBuf::from("statelog.db"));
        assert_eq!(config.recorder.record_policy, RecordPolicy::AllEvents);
        assert_eq!(config.recorder.max_write_attempts, 5);
        assert_eq!(config.recorder.drain_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [store]
            backend = "memory"
            path = "/tmp/history.db"

            [recorder]
            record_policy = "state_changes"
            max_write_attempts = 3
            retry_backoff_ms = 10
            max_backoff_ms = 50
            drain_timeout_secs = 5
        "#;

        let config: StatelogConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.path, PathBuf::from("/tmp/history.db"));
        assert_eq!(config.recorder.record_policy, RecordPolicy::StateChanges);
        assert_eq!(config.recorder.max_write_attempts, 3);
        assert_eq!(config.recorder.drain_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and keys use defaults
        let toml = r#"
            [recorder]
            max_write_attempts = 2
        "#;

        let config: StatelogConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.recorder.max_write_attempts, 2);
        assert_eq!(config.recorder.retry_backoff_ms, 100);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RecorderConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 500,
            ..RecorderConfig::default()
        };

        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_millis(500));
        assert_eq!(config.backoff_for(80), Duration::from_millis(500));
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("statelog.toml");
        std::fs::write(&path, "[store]\nbackend = \"memory\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/statelog.toml"));
        assert!(result.is_err());
    }
}
