//! Persistent log of entries that failed to replicate.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::store::RecordStore;
use crate::types::now_us;

/// One failed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    /// Shard or pipe the entry belonged to.
    pub source: String,
    /// Key of the failed entry.
    pub name: String,
    /// Rendered error.
    pub message: String,
    /// When the failure was recorded (microseconds since epoch).
    pub timestamp_us: u64,
}

/// Sharded error log, written round-robin.
pub struct SyncErrorLog {
    records: RecordStore,
    num_shards: u32,
    counter: AtomicU64,
}

impl SyncErrorLog {
    /// Creates a log over `num_shards` shards.
    pub fn new(records: RecordStore, num_shards: u32) -> Self {
        Self {
            records,
            num_shards: num_shards.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Number of shards.
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Key prefix of one shard.
    pub fn shard_prefix(shard: u32) -> String {
        format!("sync.error-log.{}/", shard)
    }

    /// Appends a failure.
    pub async fn record(&self, source: &str, name: &str, error: &SyncError) -> Result<()> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let shard = (seq % u64::from(self.num_shards)) as u32;
        let entry = ErrorLogEntry {
            source: source.to_string(),
            name: name.to_string(),
            message: error.to_string(),
            timestamp_us: now_us(),
        };
        let key = format!(
            "{}{:020}.{:010}",
            Self::shard_prefix(shard),
            entry.timestamp_us,
            seq
        );
        warn!(source, name, error = %error, shard, "recorded sync error");
        self.records.create(&key, &entry).await?;
        Ok(())
    }

    /// Oldest `max` entries of one shard.
    pub async fn list(&self, shard: u32, max: usize) -> Result<Vec<ErrorLogEntry>> {
        let prefix = Self::shard_prefix(shard);
        let keys = self.records.list_keys(&prefix, "", max).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self
                .records
                .read::<ErrorLogEntry>(&format!("{}{}", prefix, key))
                .await?
            {
                out.push(v.value);
            }
        }
        Ok(out)
    }

    /// Entries across all shards.
    pub async fn list_all(&self, max_per_shard: usize) -> Result<Vec<ErrorLogEntry>> {
        let mut out = Vec::new();
        for shard in 0..self.num_shards {
            out.extend(self.list(shard, max_per_shard).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn log(shards: u32) -> SyncErrorLog {
        SyncErrorLog::new(RecordStore::new(Arc::new(MemoryStore::new())), shards)
    }

    #[tokio::test]
    async fn test_round_robin_over_shards() {
        let log = log(2);
        for i in 0..4 {
            log.record("meta.0", &format!("user:u{}", i), &SyncError::Remote {
                msg: "403".into(),
            })
            .await
            .unwrap();
        }
        let s0 = log.list(0, 10).await.unwrap();
        let s1 = log.list(1, 10).await.unwrap();
        assert_eq!(s0.len(), 2);
        assert_eq!(s1.len(), 2);
        assert_eq!(s0[0].name, "user:u0");
        assert_eq!(s1[0].name, "user:u1");
        assert_eq!(s0[0].message, "remote error: 403");
    }

    #[tokio::test]
    async fn test_list_all_and_limit() {
        let log = log(3);
        for i in 0..7 {
            log.record("b", &i.to_string(), &SyncError::again("x"))
                .await
                .unwrap();
        }
        assert_eq!(log.list_all(100).await.unwrap().len(), 7);
        assert_eq!(log.list(0, 1).await.unwrap().len(), 1);
    }
}
