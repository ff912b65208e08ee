//! Configuration types for the sync pipeline.
//!
//! [`SyncConfig`] groups the tuning knobs of the batcher, the connection
//! manager and the offline queue. Every field has a default, so a TOML file
//! only needs to name what it overrides:
//!
//! ```toml
//! [batch]
//! debounce_ms = 500
//!
//! [connection]
//! max_retries = 3
//! ```
//!
//! # Example
//!
//! ```ignore
//! use coedit_core::config::SyncConfig;
//!
//! let config = SyncConfig::from_toml_str("[offline]\nenabled = false\n")?;
//! assert!(!config.offline.enabled);
//! assert_eq!(config.batch.max_batch_size, 50);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoeditError, Result};

/// Top-level sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Update batching policy
    pub batch: BatchConfig,

    /// Connection and reconnection policy
    pub connection: ConnectionConfig,

    /// Offline queue policy
    pub offline: OfflineConfig,
}

/// Batching policy for outbound updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Quiet period after the last local change before a flush
    pub debounce_ms: u64,

    /// Number of deltas that forces an immediate flush
    pub max_batch_size: usize,

    /// Upper bound on how long a batch may stay open, regardless of activity
    pub max_wait_ms: u64,

    /// Send attempts after the first before a batch is given up
    pub max_send_retries: u32,
}

/// Connection state machine policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay before the first reconnection attempt
    pub initial_retry_delay_ms: u64,

    /// Cap on the reconnection delay
    pub max_retry_delay_ms: u64,

    /// Failed attempts tolerated before the connection is marked failed
    pub max_retries: u32,

    /// Growth factor of the reconnection delay
    pub backoff_multiplier: f64,

    /// Interval of the connectivity re-check while connected
    pub health_check_interval_ms: u64,

    /// Time limit for a single connectivity test
    pub connection_timeout_ms: u64,
}

/// Offline queue policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Whether edits made while disconnected are queued for replay
    pub enabled: bool,

    /// Queue bound; the oldest operations are dropped past it
    pub max_offline_operations: usize,

    /// Merge divergent states automatically instead of waiting for a
    /// resolution strategy
    pub auto_resolve_conflicts: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            max_batch_size: 50,
            max_wait_ms: 2000,
            max_send_retries: 5,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_retries: 10,
            backoff_multiplier: 2.0,
            health_check_interval_ms: 30_000,
            connection_timeout_ms: 10_000,
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_offline_operations: 1000,
            auto_resolve_conflicts: false,
        }
    }
}

impl BatchConfig {
    /// Debounce period as a `Duration`.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Max-wait period as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl ConnectionConfig {
    /// Initial retry delay as a `Duration`.
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Maximum retry delay as a `Duration`.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Health check interval as a `Duration`.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Connectivity test timeout as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl SyncConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from a TOML file, or the defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(CoeditError::InvalidConfig(
                "batch.max_batch_size must be at least 1".into(),
            ));
        }
        if !self.connection.backoff_multiplier.is_finite()
            || self.connection.backoff_multiplier < 1.0
        {
            return Err(CoeditError::InvalidConfig(format!(
                "connection.backoff_multiplier must be >= 1.0, got {}",
                self.connection.backoff_multiplier
            )));
        }
        if self.connection.initial_retry_delay_ms > self.connection.max_retry_delay_ms {
            return Err(CoeditError::InvalidConfig(
                "connection.initial_retry_delay_ms exceeds connection.max_retry_delay_ms".into(),
            ));
        }
        if self.offline.max_offline_operations == 0 {
            return Err(CoeditError::InvalidConfig(
                "offline.max_offline_operations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch.debounce_ms, 300);
        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.batch.max_wait_ms, 2000);
        assert_eq!(config.batch.max_send_retries, 5);
        assert_eq!(config.connection.initial_retry_delay_ms, 1000);
        assert_eq!(config.connection.max_retry_delay_ms, 30_000);
        assert_eq!(config.connection.max_retries, 10);
        assert_eq!(config.connection.backoff_multiplier, 2.0);
        assert_eq!(config.connection.health_check_interval_ms, 30_000);
        assert_eq!(config.connection.connection_timeout_ms, 10_000);
        assert!(config.offline.enabled);
        assert_eq!(config.offline.max_offline_operations, 1000);
        assert!(!config.offline.auto_resolve_conflicts);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [batch]
            debounce_ms = 500

            [connection]
            max_retries = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.debounce_ms, 500);
        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.connection.max_retries, 3);
        assert!(config.offline.enabled);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SyncConfig::from_toml_str("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SyncConfig::from_toml_str("[batch]\nmax_batch_size = 0\n").unwrap_err();
        assert!(matches!(err, CoeditError::InvalidConfig(_)));

        let err =
            SyncConfig::from_toml_str("[connection]\nbackoff_multiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, CoeditError::InvalidConfig(_)));

        let err = SyncConfig::from_toml_str("[batch]\ndebounce_ms = \"soon\"\n").unwrap_err();
        assert!(matches!(err, CoeditError::ConfigParse(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.offline.auto_resolve_conflicts = true;
        config.connection.backoff_multiplier = 1.5;
        config.save(&path).unwrap();

        assert_eq!(SyncConfig::load(&path).unwrap(), config);
        assert_eq!(
            SyncConfig::load_or_default(&dir.path().join("missing.toml")).unwrap(),
            SyncConfig::default()
        );
    }
}
