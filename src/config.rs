//! dirrepl Configuration
//!
//! Configuration structures for the replication core: changelog storage,
//! pending-write queue sizing and assured-replication behavior.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replica-specific configuration
    pub replica: ReplicaConfig,

    /// Changelog storage configuration
    #[serde(default)]
    pub changelog: ChangelogConfig,

    /// Pending-write queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Assured replication configuration
    #[serde(default)]
    pub assured: AssuredConfig,
}

/// Replica-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Unique replica identifier within the topology (must be non-zero;
    /// zero is the counter-record sentinel)
    pub server_id: u32,

    /// Replicated suffix (base DN) this replica serves
    pub suffix: String,

    /// Data directory for changelog storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Changelog storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogConfig {
    /// Retention age for changelog records in seconds (0 = infinite)
    #[serde(default = "default_purge_delay_secs")]
    pub purge_delay_secs: u64,

    /// Number of real records between embedded counter records
    #[serde(default = "default_counter_window_size")]
    pub counter_window_size: u64,

    /// Records flushed from the pending queue per chunk
    #[serde(default = "default_flush_chunk_size")]
    pub flush_chunk_size: usize,

    /// Idle sleep between flush/trim iterations in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Records deleted per trim batch
    #[serde(default = "default_trim_batch_size")]
    pub trim_batch_size: usize,

    /// Enable LZ4 compression for stored records
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Maximum records per catch-up burst
    #[serde(default = "default_catchup_max_records")]
    pub catchup_max_records: usize,

    /// Maximum bytes per catch-up burst
    #[serde(default = "default_catchup_max_bytes")]
    pub catchup_max_bytes: usize,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            purge_delay_secs: default_purge_delay_secs(),
            counter_window_size: default_counter_window_size(),
            flush_chunk_size: default_flush_chunk_size(),
            flush_interval_ms: default_flush_interval_ms(),
            trim_batch_size: default_trim_batch_size(),
            compression: default_compression(),
            fsync: default_fsync(),
            catchup_max_records: default_catchup_max_records(),
            catchup_max_bytes: default_catchup_max_bytes(),
        }
    }
}

impl ChangelogConfig {
    /// Retention age as a Duration (None = keep forever)
    pub fn purge_delay(&self) -> Option<Duration> {
        if self.purge_delay_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.purge_delay_secs))
        }
    }
}

/// Pending-write queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued records before producers block
    #[serde(default = "default_queue_max_records")]
    pub max_records: usize,

    /// Low watermark as a ratio of max (waiters released below this)
    #[serde(default = "default_low_mark_ratio")]
    pub low_mark_ratio: f64,

    /// High watermark as a ratio of max
    #[serde(default = "default_high_mark_ratio")]
    pub high_mark_ratio: f64,

    /// Byte threshold multiplier relative to the record thresholds
    /// (bounds memory independent of record size variance)
    #[serde(default = "default_byte_scale")]
    pub byte_scale: usize,

    /// How often a blocked producer re-checks for space, in milliseconds
    #[serde(default = "default_enqueue_recheck_ms")]
    pub enqueue_recheck_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_records: default_queue_max_records(),
            low_mark_ratio: default_low_mark_ratio(),
            high_mark_ratio: default_high_mark_ratio(),
            byte_scale: default_byte_scale(),
            enqueue_recheck_ms: default_enqueue_recheck_ms(),
        }
    }
}

impl QueueConfig {
    /// Low watermark in records
    pub fn low_mark(&self) -> usize {
        ((self.max_records as f64) * self.low_mark_ratio).ceil() as usize
    }

    /// High watermark in records
    pub fn high_mark(&self) -> usize {
        ((self.max_records as f64) * self.high_mark_ratio).ceil() as usize
    }

    /// Maximum queued bytes before producers block
    pub fn max_bytes(&self) -> usize {
        self.max_records * self.byte_scale
    }

    /// Low watermark in bytes
    pub fn low_mark_bytes(&self) -> usize {
        self.low_mark() * self.byte_scale
    }

    /// High watermark in bytes
    pub fn high_mark_bytes(&self) -> usize {
        self.high_mark() * self.byte_scale
    }
}

/// Assured replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssuredConfig {
    /// Timeout for assured acknowledgments in milliseconds
    #[serde(default = "default_assured_timeout_ms")]
    pub timeout_ms: u64,

    /// Group id this replica belongs to (safe-read eligibility)
    #[serde(default = "default_group_id")]
    pub group_id: u8,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_assured_timeout_ms(),
            group_id: default_group_id(),
        }
    }
}

impl AssuredConfig {
    /// Assured-ack timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ReplicationConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.replica.server_id == 0 {
            return Err(Error::Config(
                "replica.server_id must be non-zero (zero is the counter sentinel)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.low_mark_ratio)
            || !(0.0..=1.0).contains(&self.queue.high_mark_ratio)
        {
            return Err(Error::Config(
                "queue watermark ratios must lie in [0, 1]".into(),
            ));
        }
        if self.queue.low_mark_ratio > self.queue.high_mark_ratio {
            return Err(Error::Config(
                "queue.low_mark_ratio must not exceed queue.high_mark_ratio".into(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dirrepl")
}

fn default_purge_delay_secs() -> u64 {
    3 * 24 * 3600
}

fn default_counter_window_size() -> u64 {
    1000
}

fn default_flush_chunk_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_trim_batch_size() -> usize {
    5000
}

fn default_compression() -> bool {
    true
}

fn default_fsync() -> bool {
    true
}

fn default_catchup_max_records() -> usize {
    100
}

fn default_catchup_max_bytes() -> usize {
    50_000
}

fn default_queue_max_records() -> usize {
    5000
}

fn default_low_mark_ratio() -> f64 {
    0.2
}

fn default_high_mark_ratio() -> f64 {
    0.8
}

fn default_byte_scale() -> usize {
    200
}

fn default_enqueue_recheck_ms() -> u64 {
    500
}

fn default_assured_timeout_ms() -> u64 {
    2000
}

fn default_group_id() -> u8 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [replica]
            server_id = 3
            suffix = "dc=example,dc=com"
        "#;

        let config = ReplicationConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.replica.server_id, 3);
        assert_eq!(config.replica.suffix, "dc=example,dc=com");
        assert_eq!(config.changelog.counter_window_size, 1000);
        assert_eq!(config.queue.max_records, 5000);
        assert_eq!(config.assured.timeout_ms, 2000);
    }

    #[test]
    fn test_queue_watermarks() {
        let queue = QueueConfig::default();
        assert_eq!(queue.low_mark(), 1000);
        assert_eq!(queue.high_mark(), 4000);
        assert_eq!(queue.max_bytes(), 1_000_000);
        assert!(queue.low_mark_bytes() < queue.max_bytes());
    }

    #[test]
    fn test_rejects_zero_server_id() {
        let toml = r#"
            [replica]
            server_id = 0
            suffix = "dc=test"
        "#;
        assert!(matches!(
            ReplicationConfig::from_toml_str(toml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let toml = r#"
            [replica]
            server_id = 1
            suffix = "dc=test"

            [queue]
            low_mark_ratio = 0.9
            high_mark_ratio = 0.2
        "#;
        assert!(matches!(
            ReplicationConfig::from_toml_str(toml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_purge_delay_zero_is_infinite() {
        let mut changelog = ChangelogConfig::default();
        changelog.purge_delay_secs = 0;
        assert!(changelog.purge_delay().is_none());
    }

    #[test]
    fn test_overrides() {
        let toml = r#"
            [replica]
            server_id = 1
            suffix = "dc=test"

            [changelog]
            counter_window_size = 100
            purge_delay_secs = 60

            [queue]
            max_records = 10
            low_mark_ratio = 0.5

            [assured]
            timeout_ms = 250
        "#;

        let config = ReplicationConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.changelog.counter_window_size, 100);
        assert_eq!(config.queue.low_mark(), 5);
        assert_eq!(config.assured.timeout(), Duration::from_millis(250));
    }
}
