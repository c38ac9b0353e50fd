//! Storage Manager Configuration
//!
//! Every tunable of the storage manager: lock waits, layout tolerances,
//! reserve margins, scheduler sizing and retry policy, health thresholds
//! and persistence. Loaded from YAML; missing keys take their defaults.

use crate::domain::types::MIB;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Configuration for the storage manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bounded wait for a per-entity lock before `ConcurrentModification`
    pub lock_timeout_ms: u64,
    /// Capacity of the notification channel
    pub event_channel_capacity: usize,
    pub raid: RaidConfig,
    pub pool: PoolConfig,
    pub volume: VolumeConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub store: StoreConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            event_channel_capacity: 1024,
            raid: RaidConfig::default(),
            pool: PoolConfig::default(),
            volume: VolumeConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Reject values that would make the manager misbehave
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_count == 0 {
            return Err(Error::Configuration(
                "scheduler.worker_count must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.pool.metadata_reserve_ratio) {
            return Err(Error::Configuration(
                "pool.metadata_reserve_ratio must be in [0, 1)".into(),
            ));
        }
        if self.raid.mirror_capacity_tolerance_percent < 0.0 {
            return Err(Error::Configuration(
                "raid.mirror_capacity_tolerance_percent must not be negative".into(),
            ));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(Error::Configuration(
                "health.poll_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Component Configuration
// =============================================================================

/// RAID engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidConfig {
    /// Allowed size spread between mirror members, in percent of the smallest
    pub mirror_capacity_tolerance_percent: f64,
    /// Start a rebuild from a hot spare as soon as a group degrades
    pub auto_replace_with_spares: bool,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            mirror_capacity_tolerance_percent: 1.0,
            auto_replace_with_spares: true,
        }
    }
}

/// Pool manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Share of total capacity reserved for pool metadata
    pub metadata_reserve_ratio: f64,
    /// Lower bound of the metadata reserve
    pub min_metadata_reserve_bytes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            metadata_reserve_ratio: 0.01,
            min_metadata_reserve_bytes: 64 * MIB,
        }
    }
}

impl PoolConfig {
    /// Reserved metadata margin for a pool of `total_bytes`
    pub fn reserved_margin(&self, total_bytes: u64) -> u64 {
        let proportional = (total_bytes as f64 * self.metadata_reserve_ratio) as u64;
        proportional.max(self.min_metadata_reserve_bytes)
    }
}

/// Volume manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Directory volumes are mounted under (`<root>/<pool>/<volume>`)
    pub mount_root: PathBuf,
    /// Smallest volume that can be created
    pub min_volume_bytes: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/storage"),
            min_volume_bytes: MIB,
        }
    }
}

/// Task scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of tasks executing concurrently
    pub worker_count: usize,
    /// Retries of a transiently failing attempt before the task fails
    pub max_retries: u32,
    /// Per-attempt watchdog
    pub attempt_timeout_ms: u64,
    /// First retry delay
    pub initial_backoff_ms: u64,
    /// Cap on the retry delay
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 3,
            attempt_timeout_ms: 6 * 60 * 60 * 1000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Health monitor settings and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Polling cadence
    pub poll_interval_secs: u64,
    pub temperature_warning_celsius: i32,
    pub temperature_critical_celsius: i32,
    pub reallocated_sectors_warning: u64,
    pub reallocated_sectors_critical: u64,
    pub pending_sectors_warning: u64,
    pub pending_sectors_critical: u64,
    /// Uncorrectable I/O errors after which a disk is FAILED
    pub io_error_failure_count: u64,
    /// Number of health events retained for queries
    pub event_retention: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            temperature_warning_celsius: 55,
            temperature_critical_celsius: 65,
            reallocated_sectors_warning: 1,
            reallocated_sectors_critical: 100,
            pending_sectors_warning: 1,
            pending_sectors_critical: 50,
            io_error_failure_count: 10,
            event_retention: 1000,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Where metadata records are kept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process memory only
    Memory,
    /// One JSON file per record under `path`
    File {
        path: PathBuf,
        #[serde(default = "default_sync_writes")]
        sync_writes: bool,
    },
}

fn default_sync_writes() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            path: PathBuf::from("/var/lib/nas-storage"),
            sync_writes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
lock_timeout_ms: 50
pool:
  metadata_reserve_ratio: 0.05
store:
  backend: memory
"#;
        let config: StorageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(50));
        assert_eq!(config.pool.metadata_reserve_ratio, 0.05);
        assert_eq!(config.pool.min_metadata_reserve_bytes, 64 * MIB);
        assert_eq!(config.scheduler.worker_count, 4);
        assert_matches!(config.store, StoreConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reserved_margin() {
        let pool = PoolConfig {
            metadata_reserve_ratio: 0.01,
            min_metadata_reserve_bytes: 100,
        };
        assert_eq!(pool.reserved_margin(1_000), 100);
        assert_eq!(pool.reserved_margin(1_000_000), 10_000);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = StorageConfig::default();
        config.scheduler.worker_count = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_file_store_defaults_sync() {
        let config: StoreConfig = serde_yaml::from_str("backend: file\npath: /tmp/x\n").unwrap();
        assert_matches!(config, StoreConfig::File { sync_writes: true, .. });
    }
}
