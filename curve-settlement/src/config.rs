//! Configuration for the settlement core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted inclusion window (one year)
pub const MAX_INCLUSION_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Lifecycle timing
    pub settlement: SettlementConfig,

    /// EVM execution retry policy
    pub retry: RetryConfig,

    /// Event fan-out
    pub events: EventsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/settlement"),
            service_name: "curve-settlement".to_string(),
            rocksdb: RocksDBConfig::default(),
            settlement: SettlementConfig::default(),
            retry: RetryConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// fsync every lifecycle write
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
            sync_writes: true,
        }
    }
}

/// Lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Confirmations before SIGNED -> INCLUDED
    pub min_confirmations: u32,

    /// SIGNED intents older than this expire (seconds)
    pub inclusion_timeout_secs: u64,

    /// Execution sweep period (milliseconds)
    pub execution_interval_ms: u64,

    /// Expiry sweep period (seconds)
    pub expiry_interval_secs: u64,

    /// Per-launch actor mailbox size
    pub mailbox_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            inclusion_timeout_secs: 6 * 60 * 60, // ~36 blocks
            execution_interval_ms: 500,
            expiry_interval_secs: 60,
            mailbox_capacity: 1000,
        }
    }
}

impl SettlementConfig {
    /// Inclusion wait window
    pub fn inclusion_timeout(&self) -> crate::Result<chrono::Duration> {
        if self.inclusion_timeout_secs > MAX_INCLUSION_TIMEOUT_SECS {
            return Err(crate::Error::Config(format!(
                "inclusion_timeout_secs {} exceeds {}",
                self.inclusion_timeout_secs, MAX_INCLUSION_TIMEOUT_SECS
            )));
        }
        i64::try_from(self.inclusion_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "inclusion_timeout_secs {} out of range",
                    self.inclusion_timeout_secs
                ))
            })
    }

    /// Execution sweep period
    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    /// Expiry sweep period
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }
}

/// EVM execution retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts before FAILED (hard ceiling)
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_delay_ms: u64,

    /// Upper bound of random jitter added to each delay (milliseconds)
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 100,
        }
    }
}

/// Event fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity; slow subscribers lose old events
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("SETTLEMENT_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("SETTLEMENT_MIN_CONFIRMATIONS") {
            config.settlement.min_confirmations = parse_env("SETTLEMENT_MIN_CONFIRMATIONS", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_INCLUSION_TIMEOUT_SECS") {
            config.settlement.inclusion_timeout_secs =
                parse_env("SETTLEMENT_INCLUSION_TIMEOUT_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("SETTLEMENT_MAX_EXECUTION_ATTEMPTS") {
            config.retry.max_attempts = parse_env("SETTLEMENT_MAX_EXECUTION_ATTEMPTS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a hard ceiling or stall a sweep
    pub fn validate(&self) -> crate::Result<()> {
        if self.settlement.min_confirmations == 0 {
            return Err(crate::Error::Config(
                "min_confirmations must be at least 1".to_string(),
            ));
        }
        if self.settlement.inclusion_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "inclusion_timeout_secs must be positive".to_string(),
            ));
        }
        self.settlement.inclusion_timeout()?;
        if self.settlement.execution_interval_ms == 0 || self.settlement.expiry_interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweep intervals must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.settlement.mailbox_capacity == 0 || self.events.channel_capacity == 0 {
            return Err(crate::Error::Config(
                "channel capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}
