//! Configuration types for Quill
//!
//! Everything the storage engine consumes at construction. Durations are
//! serialized as whole milliseconds so config files stay readable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the data and offset files
    pub data_dir: PathBuf,
    /// Truncate a torn trailing record on startup instead of failing
    pub allow_recovery: bool,
    /// Record cache configuration
    pub cache: CacheConfig,
    /// Longest time buffered writes may wait for a durable flush under load
    #[serde(rename = "max_flush_wait_ms", with = "duration_ms")]
    pub max_flush_wait: Duration,
    /// Quiet period before the writer considers compaction
    #[serde(rename = "idle_time_ms", with = "duration_ms")]
    pub idle_time: Duration,
    /// Writes between two offset snapshots
    pub writes_between_offset_snapshots: u64,
    /// Minimum time between two offset snapshots
    #[serde(rename = "min_time_between_offset_snapshots_ms", with = "duration_ms")]
    pub min_time_between_offset_snapshots: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./quill-data"),
            allow_recovery: true,
            cache: CacheConfig::default(),
            max_flush_wait: Duration::from_millis(200),
            idle_time: Duration::from_secs(30),
            writes_between_offset_snapshots: 10_000,
            min_time_between_offset_snapshots: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        self.cache.validate()?;
        if self.max_flush_wait.is_zero() {
            return Err(crate::Error::Configuration(
                "max_flush_wait must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Record cache thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count above which the least used half is demoted
    pub weak_threshold: usize,
    /// Entry count above which the least used quarter is dropped
    pub hard_threshold: usize,
    /// Inserts between two eviction checks
    pub check_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            weak_threshold: 2_500,
            hard_threshold: 10_000,
            check_interval: 100,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.check_interval == 0 {
            return Err(crate::Error::Configuration(
                "cache.check_interval must be greater than zero".into(),
            ));
        }
        if self.hard_threshold < self.weak_threshold {
            return Err(crate::Error::Configuration(format!(
                "cache.hard_threshold ({}) is below cache.weak_threshold ({})",
                self.hard_threshold, self.weak_threshold
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
