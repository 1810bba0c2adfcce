//! Top-level sync records, record key layout, and operator status.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SyncState;

/// Key of the metadata sync info record.
pub const META_INFO_KEY: &str = "meta.sync-status";

/// Key of a metadata shard's marker.
pub fn meta_shard_key(shard: u32) -> String {
    format!("{}.shard.{}", META_INFO_KEY, shard)
}

/// Prefix of a metadata shard's full-sync index.
pub fn full_sync_index_prefix(shard: u32) -> String {
    format!("meta.full-sync-index.{}/", shard)
}

/// Key of a bucket pipe controller's sync info record.
pub fn bucket_info_key(controller: &str) -> String {
    format!("bucket.sync-status.{}", controller)
}

/// Key of one bucket pipe shard's marker.
pub fn bucket_shard_key(shard_id: &str) -> String {
    format!("bucket.sync-status.{}", shard_id)
}

/// Progress of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneSyncState {
    /// No shard markers exist yet.
    Init,
    /// Markers exist; inventory counts are being computed.
    BuildingFullSyncMaps,
    /// Shards are running.
    Sync,
}

/// Top-level record of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Controller state.
    pub state: ZoneSyncState,
    /// Number of shards the controller runs.
    pub num_shards: u32,
}

impl Default for SyncInfo {
    fn default() -> Self {
        Self {
            state: ZoneSyncState::Init,
            num_shards: 0,
        }
    }
}

/// Read-only view of one shard for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    /// Shard id.
    pub shard: String,
    /// Persisted phase.
    pub state: SyncState,
    /// Persisted marker.
    pub marker: String,
    /// Last observed remote head.
    pub head_marker: String,
    /// Entries processed in the current phase.
    pub pos: u64,
    /// Inventory size counted before full sync.
    pub total_entries: u64,
    /// Behind the remote head, or some entry failed terminally.
    pub lagging: bool,
    /// Entries that failed terminally since start.
    pub failed_entries: u64,
}

impl ShardStatus {
    /// Renders the status as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Renders a list of statuses as a JSON array.
pub fn statuses_to_json(statuses: &[ShardStatus]) -> Result<String> {
    Ok(serde_json::to_string_pretty(statuses)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(meta_shard_key(3), "meta.sync-status.shard.3");
        assert_eq!(full_sync_index_prefix(3), "meta.full-sync-index.3/");
        assert_eq!(bucket_info_key("east"), "bucket.sync-status.east");
        assert_eq!(
            bucket_shard_key("us-east:src:dst:0"),
            "bucket.sync-status.us-east:src:dst:0"
        );
    }

    #[test]
    fn test_status_json() {
        let s = ShardStatus {
            shard: "0".into(),
            state: SyncState::IncrementalSync,
            marker: "00005".into(),
            head_marker: "00009".into(),
            pos: 5,
            total_entries: 100,
            lagging: true,
            failed_entries: 0,
        };
        let json = s.to_json().unwrap();
        assert!(json.contains("\"state\":\"IncrementalSync\""));
        assert!(json.contains("\"lagging\":true"));
        let back: ShardStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_default_info_is_init() {
        assert_eq!(SyncInfo::default().state, ZoneSyncState::Init);
    }
}
