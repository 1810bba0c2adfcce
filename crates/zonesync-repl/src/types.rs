//! Core data types shared by the sync phases.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Replication state of a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Bulk-copying an inventory snapshot.
    FullSync,
    /// Tailing the remote change log.
    IncrementalSync,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::FullSync => write!(f, "full-sync"),
            SyncState::IncrementalSync => write!(f, "incremental-sync"),
        }
    }
}

/// Persisted progress of one shard or bucket shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    /// Current phase.
    pub state: SyncState,
    /// Resume position within the current phase.
    pub marker: String,
    /// Log position to continue from once full sync completes.
    pub next_step_marker: String,
    /// Entries processed so far in the current phase.
    pub pos: u64,
    /// Inventory size counted before full sync started.
    pub total_entries: u64,
    /// Time of the last persisted update (microseconds since epoch).
    pub timestamp_us: u64,
}

impl SyncMarker {
    /// A fresh marker for a shard whose log head is currently `head`.
    pub fn new_full_sync(head: impl Into<String>) -> Self {
        Self {
            state: SyncState::FullSync,
            marker: String::new(),
            next_step_marker: head.into(),
            pos: 0,
            total_entries: 0,
            timestamp_us: now_us(),
        }
    }

    /// Switches to incremental sync at the position captured before full sync.
    pub fn complete_full_sync(&mut self) {
        self.state = SyncState::IncrementalSync;
        self.marker = std::mem::take(&mut self.next_step_marker);
        self.pos = 0;
        self.timestamp_us = now_us();
    }
}

/// Head position of a remote log shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Marker of the newest entry in the shard.
    pub head_marker: String,
    /// Time of the newest entry (microseconds since epoch).
    pub last_update_us: u64,
}

/// Whether the source zone finished the logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// The operation completed on the source.
    Complete,
    /// The operation is still in progress on the source.
    Pending,
}

/// Operation recorded by a change-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOp {
    /// Create or overwrite.
    Write,
    /// Remove the current object.
    Delete,
    /// Point the object head at a specific version.
    LinkOlh,
    /// Point the object head at a delete marker.
    LinkOlhDeleteMarker,
    /// Remove a specific version.
    UnlinkInstance,
    /// The source abandoned the operation.
    Cancel,
}

/// A change-log or inventory entry to replicate.
///
/// `id` is the entry's position in whatever listing produced it: a log
/// marker during incremental sync, an inventory key during full sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the listing.
    pub id: String,
    /// Object or metadata key.
    pub key: String,
    /// Time of the change (microseconds since epoch).
    pub timestamp_us: u64,
    /// Source-side completion status.
    pub status: EntryStatus,
    /// Operation to replay.
    pub op: EntryOp,
    /// Version epoch for versioned buckets.
    pub versioned_epoch: Option<u64>,
    /// Object version instance, if any.
    pub instance: Option<String>,
    /// Owner of the object, if known.
    pub owner: Option<String>,
    /// Object tags used by pipe filters.
    pub tags: Vec<(String, String)>,
}

impl LogEntry {
    /// A completed write of `key` at listing position `id`.
    pub fn write(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            timestamp_us: 0,
            status: EntryStatus::Complete,
            op: EntryOp::Write,
            versioned_epoch: None,
            instance: None,
            owner: None,
            tags: Vec::new(),
        }
    }

    /// Same entry with a different operation.
    pub fn with_op(mut self, op: EntryOp) -> Self {
        self.op = op;
        self
    }

    /// Same entry with a different status.
    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    /// True when the source has finished the operation.
    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Complete
    }

    /// True when the entry names a specific, non-null object version.
    pub fn is_versioned_instance(&self) -> bool {
        matches!(self.instance.as_deref(), Some(i) if !i.is_empty() && i != "null")
    }

    /// Key operations on this entry are serialized on: the object name,
    /// qualified by its version instance when it has one.
    pub fn sync_key(&self) -> String {
        instance_key(&self.key, self.instance.as_deref())
    }
}

/// Joins an object name and a version instance into one string.
///
/// The plain name is used for unversioned and `null` instances. Instances
/// sort right after their name and before any longer name, so these strings
/// order the same way a bucket listing does.
pub fn instance_key(key: &str, instance: Option<&str>) -> String {
    match instance {
        Some(i) if !i.is_empty() && i != "null" => format!("{}\0{}", key, i),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_marker_is_full_sync() {
        let m = SyncMarker::new_full_sync("00042");
        assert_eq!(m.state, SyncState::FullSync);
        assert_eq!(m.marker, "");
        assert_eq!(m.next_step_marker, "00042");
    }

    #[test]
    fn test_complete_full_sync_moves_next_step_marker() {
        let mut m = SyncMarker::new_full_sync("00042");
        m.marker = "user:zed".to_string();
        m.pos = 250;
        m.complete_full_sync();
        assert_eq!(m.state, SyncState::IncrementalSync);
        assert_eq!(m.marker, "00042");
        assert!(m.next_step_marker.is_empty());
        assert_eq!(m.pos, 0);
    }

    #[test]
    fn test_marker_bincode_roundtrip() {
        let m = SyncMarker::new_full_sync("7");
        let bytes = bincode::serialize(&m).unwrap();
        let back: SyncMarker = bincode::deserialize(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_versioned_instance() {
        let mut e = LogEntry::write("1", "photo.jpg");
        assert!(!e.is_versioned_instance());
        e.instance = Some("null".to_string());
        assert!(!e.is_versioned_instance());
        e.instance = Some("v2".to_string());
        assert!(e.is_versioned_instance());
    }

    #[test]
    fn test_instance_keys_follow_listing_order() {
        let plain = instance_key("photo.jpg", None);
        let v1 = instance_key("photo.jpg", Some("v1"));
        let v2 = instance_key("photo.jpg", Some("v2"));
        let longer = instance_key("photo.jpg.bak", None);
        assert_eq!(plain, "photo.jpg");
        assert_eq!(instance_key("photo.jpg", Some("null")), plain);
        assert!(plain < v1 && v1 < v2 && v2 < longer);

        let mut e = LogEntry::write("1", "photo.jpg");
        assert_eq!(e.sync_key(), plain);
        e.instance = Some("v2".to_string());
        assert_eq!(e.sync_key(), v2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SyncState::FullSync.to_string(), "full-sync");
        assert_eq!(SyncState::IncrementalSync.to_string(), "incremental-sync");
    }
}
