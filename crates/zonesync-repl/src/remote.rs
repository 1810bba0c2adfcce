//! Read-only view of the source zone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{instance_key, LogEntry, ShardInfo};

/// Identifies one remote change-log shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogShard {
    /// A shard of the metadata log.
    Metadata(u32),
    /// One shard of a bucket's index log.
    BucketIndex {
        /// Source bucket name.
        bucket: String,
        /// Index shard.
        shard: u32,
    },
}

impl std::fmt::Display for LogShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogShard::Metadata(n) => write!(f, "meta:{}", n),
            LogShard::BucketIndex { bucket, shard } => write!(f, "bucket:{}:{}", bucket, shard),
        }
    }
}

/// A batch of log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    /// Entries in log order, each `id` being its marker.
    pub entries: Vec<LogEntry>,
    /// More entries follow the last one.
    pub truncated: bool,
}

/// A batch of inventory keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    /// Keys in ascending order.
    pub keys: Vec<String>,
    /// More keys follow the last one.
    pub truncated: bool,
}

/// One object in a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectListing {
    /// Object name.
    pub key: String,
    /// Version instance, if versioned.
    pub instance: Option<String>,
    /// Version epoch, if versioned.
    pub versioned_epoch: Option<u64>,
    /// Modification time (microseconds since epoch).
    pub mtime_us: u64,
    /// Object tags.
    pub tags: Vec<(String, String)>,
}

impl ObjectListing {
    /// Position of this object instance in the listing, usable as the
    /// `marker` of the next [`RemoteInventory::list_objects`] call.
    pub fn position(&self) -> String {
        instance_key(&self.key, self.instance.as_deref())
    }
}

/// A batch of bucket listing entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    /// Objects in ascending [`ObjectListing::position`] order.
    pub objects: Vec<ObjectListing>,
    /// More objects follow the last one.
    pub truncated: bool,
}

/// Change logs published by the source zone.
#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// Number of metadata log shards.
    async fn num_meta_shards(&self) -> Result<u32>;

    /// Head position of a shard.
    async fn shard_info(&self, shard: &LogShard) -> Result<ShardInfo>;

    /// Up to `max` entries strictly after `marker`.
    async fn list_entries(&self, shard: &LogShard, marker: &str, max: usize) -> Result<LogPage>;
}

/// Snapshot listings used by full sync.
#[async_trait]
pub trait RemoteInventory: Send + Sync {
    /// Metadata sections, e.g. `user`, `bucket`.
    async fn list_sections(&self) -> Result<Vec<String>>;

    /// Up to `max` keys of `section` strictly after `marker`.
    async fn list_keys(&self, section: &str, marker: &str, max: usize) -> Result<KeyPage>;

    /// Number of index shards of a bucket.
    async fn bucket_shards(&self, bucket: &str) -> Result<u32>;

    /// Up to `max` object instances of one bucket shard whose
    /// [`ObjectListing::position`] is strictly after `marker`.
    async fn list_objects(
        &self,
        bucket: &str,
        shard: u32,
        marker: &str,
        max: usize,
    ) -> Result<ObjectPage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_shard_display() {
        assert_eq!(LogShard::Metadata(3).to_string(), "meta:3");
        let b = LogShard::BucketIndex {
            bucket: "photos".into(),
            shard: 1,
        };
        assert_eq!(b.to_string(), "bucket:photos:1");
    }

    #[test]
    fn test_listing_position_includes_instance() {
        let mut obj = ObjectListing {
            key: "photo.jpg".into(),
            instance: None,
            versioned_epoch: None,
            mtime_us: 1,
            tags: Vec::new(),
        };
        assert_eq!(obj.position(), "photo.jpg");
        obj.instance = Some("v1".into());
        assert_eq!(obj.position(), "photo.jpg\0v1");
    }
}
