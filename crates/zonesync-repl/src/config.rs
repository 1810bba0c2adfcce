//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Logging configuration consumed by [`crate::telemetry::init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Tunables for the replication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lease TTL in seconds.
    pub lease_period_secs: u64,
    /// Fraction of the TTL after which a held lease is renewed.
    pub lease_renew_fraction: f64,
    /// Ceiling for the supervisor's restart delay.
    pub backoff_max_secs: u64,
    /// Maximum number of concurrently outstanding entry appliers per shard.
    pub spawn_window: usize,
    /// Completions between marker flushes for metadata shards.
    pub meta_marker_window: usize,
    /// Completions between marker flushes for bucket shards.
    pub bucket_marker_window: usize,
    /// Inventory page size used by full sync.
    pub full_sync_page_size: usize,
    /// Maximum log entries fetched per incremental batch.
    pub incremental_max_entries: usize,
    /// Sleep between head queries once a shard has caught up.
    pub poll_interval_secs: u64,
    /// Attempts per entry before a transient failure is given up on.
    pub transient_retries: u32,
    /// Number of error log shards.
    pub error_log_shards: u32,
    /// Logging setup.
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_period_secs: 120,
            lease_renew_fraction: 0.5,
            backoff_max_secs: 30,
            spawn_window: 20,
            meta_marker_window: 10,
            bucket_marker_window: 10,
            full_sync_page_size: 100,
            incremental_max_entries: 100,
            poll_interval_secs: 20,
            transient_retries: 10,
            error_log_shards: 32,
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| {
            Err(SyncError::Config {
                msg: msg.to_string(),
            })
        };
        if self.lease_period_secs == 0 {
            return bad("lease_period_secs must be positive");
        }
        if !(self.lease_renew_fraction > 0.0 && self.lease_renew_fraction < 1.0) {
            return bad("lease_renew_fraction must be within (0, 1)");
        }
        if self.spawn_window == 0 {
            return bad("spawn_window must be positive");
        }
        if self.meta_marker_window == 0 || self.bucket_marker_window == 0 {
            return bad("marker windows must be positive");
        }
        if self.full_sync_page_size == 0 || self.incremental_max_entries == 0 {
            return bad("page sizes must be positive");
        }
        if self.transient_retries == 0 {
            return bad("transient_retries must be positive");
        }
        if self.error_log_shards == 0 {
            return bad("error_log_shards must be positive");
        }
        Ok(())
    }

    /// Lease TTL.
    pub fn lease_period(&self) -> Duration {
        Duration::from_secs(self.lease_period_secs)
    }

    /// Interval between lease renewals.
    pub fn lease_renew_interval(&self) -> Duration {
        self.lease_period().mul_f64(self.lease_renew_fraction)
    }

    /// Supervisor backoff ceiling.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Incremental poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
