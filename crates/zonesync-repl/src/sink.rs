//! Destinations for replicated bucket data.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::store::RecordStore;
use crate::types::instance_key;

/// Source and destination of one bucket pipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketInfo {
    /// Zone the data comes from.
    pub source_zone: String,
    /// Bucket the data comes from.
    pub source_bucket: String,
    /// Bucket the data is written to.
    pub dest_bucket: String,
}

/// Identifies the object an entry refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object name.
    pub key: String,
    /// Version instance, if any.
    pub instance: Option<String>,
    /// Version epoch, if any.
    pub versioned_epoch: Option<u64>,
    /// Time of the change (microseconds since epoch).
    pub mtime_us: u64,
}

/// Callbacks the engine invokes once per applicable bucket log entry.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Creates or updates an object.
    async fn sync_object(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()>;

    /// Removes an object, or one version of it when `versioned`.
    async fn remove_object(&self, bucket: &BucketInfo, obj: &ObjectRef, versioned: bool)
        -> Result<()>;

    /// Places a delete marker on a versioned object.
    async fn create_delete_marker(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()>;
}

/// A callback seen by [`LogSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    /// `sync_object`.
    Sync(String),
    /// `remove_object`.
    Remove {
        /// Object name.
        key: String,
        /// Version removal.
        versioned: bool,
    },
    /// `create_delete_marker`.
    DeleteMarker(String),
}

/// Sink that only logs each callback.
#[derive(Default)]
pub struct LogSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl LogSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks received so far.
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(&self, call: SinkCall) -> Result<()> {
        self.calls
            .lock()
            .map_err(|e| SyncError::storage(e.to_string()))?
            .push(call);
        Ok(())
    }
}

#[async_trait]
impl DataSink for LogSink {
    async fn sync_object(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()> {
        info!(
            bucket = %bucket.dest_bucket,
            key = %obj.key,
            epoch = ?obj.versioned_epoch,
            "sync_object"
        );
        self.push(SinkCall::Sync(obj.key.clone()))
    }

    async fn remove_object(
        &self,
        bucket: &BucketInfo,
        obj: &ObjectRef,
        versioned: bool,
    ) -> Result<()> {
        info!(bucket = %bucket.dest_bucket, key = %obj.key, versioned, "remove_object");
        self.push(SinkCall::Remove {
            key: obj.key.clone(),
            versioned,
        })
    }

    async fn create_delete_marker(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()> {
        info!(bucket = %bucket.dest_bucket, key = %obj.key, "create_delete_marker");
        self.push(SinkCall::DeleteMarker(obj.key.clone()))
    }
}

/// Object content read from the source zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Object data.
    pub data: Bytes,
    /// Modification time (microseconds since epoch).
    pub mtime_us: u64,
    /// Version epoch, if versioned.
    pub versioned_epoch: Option<u64>,
}

/// Reads objects from the source zone.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Current object content, or `None` if it no longer exists.
    async fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        instance: Option<&str>,
    ) -> Result<Option<RemoteObject>>;
}

/// Replicated object as stored by [`ReplicaSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaObject {
    /// Object data, empty for tombstones.
    pub data: Vec<u8>,
    /// Modification time of the applied change.
    pub mtime_us: u64,
    /// Version epoch of the applied change.
    pub versioned_epoch: u64,
    /// The object was removed.
    pub deleted: bool,
    /// The removal is a versioned delete marker.
    pub delete_marker: bool,
}

impl ReplicaObject {
    fn order(&self) -> (u64, u64) {
        (self.versioned_epoch, self.mtime_us)
    }
}

/// Write-through replica in local persistence, last writer wins.
///
/// Each object has a head record holding its newest change. Versioned
/// instances additionally get a record of their own, so linking several
/// versions of one key keeps all of them.
pub struct ReplicaSink {
    fetcher: Arc<dyn ObjectFetcher>,
    records: RecordStore,
}

impl ReplicaSink {
    /// Creates a sink storing replicas in `records`.
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, records: RecordStore) -> Self {
        Self { fetcher, records }
    }

    /// Record key of a replicated object head, or of one of its instances.
    pub fn object_key(bucket: &str, key: &str, instance: Option<&str>) -> String {
        format!("replica.{}/{}", bucket, instance_key(key, instance))
    }

    /// Reads the head record of a replicated object.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Option<ReplicaObject>> {
        self.read(&Self::object_key(bucket, key, None)).await
    }

    /// Reads the record of one replicated version instance.
    pub async fn get_version(
        &self,
        bucket: &str,
        key: &str,
        instance: &str,
    ) -> Result<Option<ReplicaObject>> {
        self.read(&Self::object_key(bucket, key, Some(instance)))
            .await
    }

    async fn read(&self, record_key: &str) -> Result<Option<ReplicaObject>> {
        Ok(self
            .records
            .read::<ReplicaObject>(record_key)
            .await?
            .map(|v| v.value))
    }

    /// Writes `incoming` to the instance record, if the change names one,
    /// and to the head record.
    async fn apply_versioned(
        &self,
        bucket: &str,
        obj: &ObjectRef,
        incoming: ReplicaObject,
    ) -> Result<()> {
        if let Some(instance) = versioned_instance(obj) {
            self.apply(&Self::object_key(bucket, &obj.key, Some(instance)), incoming.clone())
                .await?;
        }
        self.apply(&Self::object_key(bucket, &obj.key, None), incoming)
            .await
    }

    async fn apply(&self, record_key: &str, incoming: ReplicaObject) -> Result<()> {
        let current = self.records.read::<ReplicaObject>(record_key).await?;
        let expected = match &current {
            Some(cur) if cur.value.order() >= incoming.order() => {
                debug!(%record_key, "replica already newer, skipping");
                return Ok(());
            }
            Some(cur) => Some(cur.version),
            None => None,
        };
        match expected {
            Some(version) => {
                self.records
                    .write(record_key, &incoming, Some(version))
                    .await?;
            }
            None => {
                self.records.create(record_key, &incoming).await?;
            }
        }
        Ok(())
    }
}

fn versioned_instance(obj: &ObjectRef) -> Option<&str> {
    obj.instance
        .as_deref()
        .filter(|i| !i.is_empty() && *i != "null")
}

#[async_trait]
impl DataSink for ReplicaSink {
    async fn sync_object(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()> {
        let fetched = self
            .fetcher
            .fetch_object(&bucket.source_bucket, &obj.key, obj.instance.as_deref())
            .await?;
        let Some(remote) = fetched else {
            debug!(key = %obj.key, "object gone on source, nothing to sync");
            return Ok(());
        };
        let incoming = ReplicaObject {
            data: remote.data.to_vec(),
            mtime_us: remote.mtime_us,
            versioned_epoch: remote.versioned_epoch.or(obj.versioned_epoch).unwrap_or(0),
            deleted: false,
            delete_marker: false,
        };
        self.apply_versioned(&bucket.dest_bucket, obj, incoming)
            .await
    }

    async fn remove_object(
        &self,
        bucket: &BucketInfo,
        obj: &ObjectRef,
        versioned: bool,
    ) -> Result<()> {
        let incoming = ReplicaObject {
            data: Vec::new(),
            mtime_us: obj.mtime_us,
            versioned_epoch: obj.versioned_epoch.unwrap_or(0),
            deleted: true,
            delete_marker: false,
        };
        // Unlinking one version leaves the head record alone.
        match versioned_instance(obj) {
            Some(instance) if versioned => {
                let record_key = Self::object_key(&bucket.dest_bucket, &obj.key, Some(instance));
                self.apply(&record_key, incoming).await
            }
            _ => {
                self.apply(&Self::object_key(&bucket.dest_bucket, &obj.key, None), incoming)
                    .await
            }
        }
    }

    async fn create_delete_marker(&self, bucket: &BucketInfo, obj: &ObjectRef) -> Result<()> {
        let incoming = ReplicaObject {
            data: Vec::new(),
            mtime_us: obj.mtime_us,
            versioned_epoch: obj.versioned_epoch.unwrap_or(0),
            deleted: true,
            delete_marker: true,
        };
        self.apply_versioned(&bucket.dest_bucket, obj, incoming)
            .await
    }
}
