//! Configuration management for Flowstate.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "FLOWSTATE_CONFIG";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store settings
    pub store: StoreConfig,

    /// Event bus settings
    pub bus: BusConfig,
}

/// Store and lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the shared JSON document (`~` is expanded)
    pub path: String,

    /// How long a writer waits for the lock before treating it as stale
    pub lock_timeout_ms: u64,

    /// Sleep between lock attempts
    pub lock_poll_ms: u64,

    /// Minimum time between rotated backups
    pub backup_interval_secs: u64,

    /// Number of backups to keep
    pub backup_retention: usize,
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of events handled concurrently
    pub workers: usize,

    /// Per-handler execution timeout
    pub handler_timeout_secs: u64,

    /// Retries before an event is dead-lettered
    pub max_retries: u32,

    /// Capacity of the dead-letter ring buffer
    pub dead_letter_capacity: usize,

    /// Delay before the first retry (0 = re-enqueue immediately)
    pub retry_delay_ms: u64,

    /// Upper bound for backoff delays
    pub retry_max_delay_ms: u64,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `$FLOWSTATE_CONFIG`
    /// 2. `.flowstate.toml` in current directory
    /// 3. `~/.config/flowstate/config.toml`
    /// 4. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        if let Some(path) = Self::find_config_file() {
            return Self::load_from_file(&path);
        }
        Ok(Self::default())
    }

    /// The config file `load` would read, if any.
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.is_empty() {
                return Some(PathBuf::from(explicit));
            }
        }

        let local_config = PathBuf::from(".flowstate.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        Self::config_dir().map(|d| d.join("config.toml")).filter(|p| p.exists())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("flowstate"))
    }
}

impl StoreConfig {
    /// Store path with `~` and environment variables expanded.
    pub fn resolved_path(&self) -> PathBuf {
        match shellexpand::full(&self.path) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "Could not expand store path");
                PathBuf::from(&self.path)
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

impl BusConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: ".flowstate/workflow.json".to_string(),
            lock_timeout_ms: 10_000,
            lock_poll_ms: 50,
            backup_interval_secs: 300,
            backup_retention: 10,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            handler_timeout_secs: 30,
            max_retries: 3,
            dead_letter_capacity: 1000,
            retry_delay_ms: 0,
            retry_max_delay_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.path, ".flowstate/workflow.json");
        assert_eq!(config.store.backup_retention, 10);
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.bus.dead_letter_capacity, 1000);
        assert_eq!(config.bus.handler_timeout(), Duration::from_secs(30));
        assert!(config.bus.workers >= 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[store]"));
        assert!(toml_str.contains("[bus]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [store]
            path = "/tmp/work.json"
            backup_retention = 3

            [bus]
            workers = 1
            max_retries = 5
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.path, "/tmp/work.json");
        assert_eq!(config.store.backup_retention, 3);
        assert_eq!(config.store.lock_timeout_ms, 10_000);
        assert_eq!(config.bus.workers, 1);
        assert_eq!(config.bus.max_retries, 5);
        assert_eq!(config.bus.dead_letter_capacity, 1000);
    }

    #[test]
    fn test_resolved_path_expands_home() {
        let config = StoreConfig { path: "~/flows.json".to_string(), ..Default::default() };
        let resolved = config.resolved_path();
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with("flows.json"));
    }

    #[test]
    #[serial]
    fn test_load_from_env_var() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[bus]\nmax_retries = 7\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let config = Config::load();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(config.unwrap().bus.max_retries, 7);
    }

    #[test]
    #[serial]
    fn test_env_var_pointing_at_missing_file_errors() {
        std::env::set_var(CONFIG_ENV, "/definitely/not/here.toml");
        let result = Config::load();
        std::env::remove_var(CONFIG_ENV);

        assert!(result.is_err());
    }
}
