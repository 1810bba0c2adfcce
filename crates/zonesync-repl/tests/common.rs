//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use zonesync_repl::applier::SingleEntryApplier;
use zonesync_repl::backend::{hash_shard, MetadataBackend};
use zonesync_repl::error_log::SyncErrorLog;
use zonesync_repl::flow::{ShardContext, ShardFlow};
use zonesync_repl::registry::ShardHandle;
use zonesync_repl::remote::{
    KeyPage, LogPage, LogShard, ObjectListing, ObjectPage, RemoteInventory, RemoteLog,
};
use zonesync_repl::sink::{ObjectFetcher, RemoteObject};
use zonesync_repl::{
    EntryOp, LogEntry, MemoryStore, RecordStore, Result, ShardInfo, SyncConfig, SyncError,
};

/// Default configuration with a shorter backoff ceiling.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        backoff_max_secs: 8,
        ..Default::default()
    }
}

#[derive(Default)]
struct ZoneState {
    meta: BTreeMap<String, Bytes>,
    meta_logs: HashMap<u32, Vec<LogEntry>>,
    objects: BTreeMap<String, BTreeMap<String, (Bytes, u64)>>,
    bucket_logs: HashMap<String, Vec<LogEntry>>,
    local_meta: BTreeMap<String, Bytes>,
    transient_failures: HashMap<String, u32>,
    permanent_failures: HashMap<String, SyncError>,
    stores: HashMap<String, u32>,
    seq: u64,
}

/// In-process source zone plus the local metadata backend it feeds.
pub struct FakeZone {
    meta_shards: u32,
    state: Mutex<ZoneState>,
    head_calls: AtomicU64,
}

impl FakeZone {
    pub fn new(meta_shards: u32) -> Arc<Self> {
        Arc::new(Self {
            meta_shards,
            state: Mutex::new(ZoneState::default()),
            head_calls: AtomicU64::new(0),
        })
    }

    fn next_id(state: &mut ZoneState) -> String {
        state.seq += 1;
        format!("{:08}", state.seq)
    }

    /// Metadata shard of `section:name`.
    pub fn meta_shard(&self, key: &str) -> u32 {
        hash_shard(key, self.meta_shards)
    }

    /// Creates a record without logging it, as if it predates the log.
    pub fn seed_meta(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .meta
            .insert(key.to_string(), Bytes::from(value.to_string()));
    }

    /// Writes a record and logs the change.
    pub fn put_meta(&self, key: &str, value: &str) -> String {
        let shard = self.meta_shard(key);
        let mut state = self.state.lock().unwrap();
        state
            .meta
            .insert(key.to_string(), Bytes::from(value.to_string()));
        let id = Self::next_id(&mut state);
        state
            .meta_logs
            .entry(shard)
            .or_default()
            .push(LogEntry::write(id.clone(), key));
        id
    }

    /// Removes a record and logs the change.
    pub fn delete_meta(&self, key: &str) -> String {
        let shard = self.meta_shard(key);
        let mut state = self.state.lock().unwrap();
        state.meta.remove(key);
        let id = Self::next_id(&mut state);
        state
            .meta_logs
            .entry(shard)
            .or_default()
            .push(LogEntry::write(id.clone(), key).with_op(EntryOp::Delete));
        id
    }

    /// Appends a raw entry to a metadata log shard.
    pub fn push_meta_log(&self, shard: u32, entry: LogEntry) {
        self.state
            .lock()
            .unwrap()
            .meta_logs
            .entry(shard)
            .or_default()
            .push(entry);
    }

    pub fn next_log_id(&self) -> String {
        Self::next_id(&mut self.state.lock().unwrap())
    }

    /// Creates an object without logging it.
    pub fn seed_object(&self, bucket: &str, key: &str, data: &str, mtime_us: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), (Bytes::from(data.to_string()), mtime_us));
    }

    /// Writes an object and logs the change.
    pub fn put_object(&self, bucket: &str, key: &str, data: &str, mtime_us: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), (Bytes::from(data.to_string()), mtime_us));
        let id = Self::next_id(&mut state);
        let mut entry = LogEntry::write(id, key);
        entry.timestamp_us = mtime_us;
        state
            .bucket_logs
            .entry(bucket.to_string())
            .or_default()
            .push(entry);
    }

    /// Removes an object and logs the change.
    pub fn delete_object(&self, bucket: &str, key: &str, mtime_us: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(objects) = state.objects.get_mut(bucket) {
            objects.remove(key);
        }
        let id = Self::next_id(&mut state);
        let mut entry = LogEntry::write(id, key).with_op(EntryOp::Delete);
        entry.timestamp_us = mtime_us;
        state
            .bucket_logs
            .entry(bucket.to_string())
            .or_default()
            .push(entry);
    }

    /// Makes the next `times` fetches of `key` fail with a transient error.
    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .transient_failures
            .insert(key.to_string(), times);
    }

    /// Makes every fetch of `key` fail with `err`.
    pub fn fail_permanently(&self, key: &str, err: SyncError) {
        self.state
            .lock()
            .unwrap()
            .permanent_failures
            .insert(key.to_string(), err);
    }

    pub fn remote_meta(&self) -> BTreeMap<String, Bytes> {
        self.state.lock().unwrap().meta.clone()
    }

    pub fn local_meta(&self) -> BTreeMap<String, Bytes> {
        self.state.lock().unwrap().local_meta.clone()
    }

    /// Number of local stores of `key`.
    pub fn store_count(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .stores
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn head_calls(&self) -> u64 {
        self.head_calls.load(Ordering::SeqCst)
    }

    fn log_for(state: &ZoneState, shard: &LogShard) -> Vec<LogEntry> {
        match shard {
            LogShard::Metadata(n) => state.meta_logs.get(n).cloned().unwrap_or_default(),
            LogShard::BucketIndex { bucket, .. } => {
                state.bucket_logs.get(bucket).cloned().unwrap_or_default()
            }
        }
    }
}

#[async_trait]
impl RemoteLog for FakeZone {
    async fn num_meta_shards(&self) -> Result<u32> {
        Ok(self.meta_shards)
    }

    async fn shard_info(&self, shard: &LogShard) -> Result<ShardInfo> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let log = Self::log_for(&state, shard);
        Ok(log
            .last()
            .map(|e| ShardInfo {
                head_marker: e.id.clone(),
                last_update_us: e.timestamp_us,
            })
            .unwrap_or_default())
    }

    async fn list_entries(&self, shard: &LogShard, marker: &str, max: usize) -> Result<LogPage> {
        let state = self.state.lock().unwrap();
        let after: Vec<LogEntry> = Self::log_for(&state, shard)
            .into_iter()
            .filter(|e| e.id.as_str() > marker)
            .collect();
        let truncated = after.len() > max;
        Ok(LogPage {
            entries: after.into_iter().take(max).collect(),
            truncated,
        })
    }
}

#[async_trait]
impl RemoteInventory for FakeZone {
    async fn list_sections(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut sections: Vec<String> = state
            .meta
            .keys()
            .filter_map(|k| k.split_once(':').map(|(s, _)| s.to_string()))
            .collect();
        sections.dedup();
        Ok(sections)
    }

    async fn list_keys(&self, section: &str, marker: &str, max: usize) -> Result<KeyPage> {
        let state = self.state.lock().unwrap();
        let names: Vec<String> = state
            .meta
            .keys()
            .filter_map(|k| k.split_once(':'))
            .filter(|(s, name)| *s == section && *name > marker)
            .map(|(_, name)| name.to_string())
            .collect();
        let truncated = names.len() > max;
        Ok(KeyPage {
            keys: names.into_iter().take(max).collect(),
            truncated,
        })
    }

    async fn bucket_shards(&self, _bucket: &str) -> Result<u32> {
        Ok(1)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        _shard: u32,
        marker: &str,
        max: usize,
    ) -> Result<ObjectPage> {
        let state = self.state.lock().unwrap();
        let all: Vec<ObjectListing> = state
            .objects
            .get(bucket)
            .map(|objs| {
                objs.iter()
                    .filter(|(k, _)| k.as_str() > marker)
                    .map(|(k, (_, mtime))| ObjectListing {
                        key: k.clone(),
                        instance: None,
                        versioned_epoch: None,
                        mtime_us: *mtime,
                        tags: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let truncated = all.len() > max;
        Ok(ObjectPage {
            objects: all.into_iter().take(max).collect(),
            truncated,
        })
    }
}

#[async_trait]
impl MetadataBackend for FakeZone {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.permanent_failures.get(key) {
            return Err(err.clone());
        }
        if let Some(left) = state.transient_failures.get_mut(key) {
            if *left > 0 {
                *left -= 1;
                return Err(SyncError::again(format!("{} busy", key)));
            }
        }
        Ok(state.meta.get(key).cloned())
    }

    async fn store(&self, key: &str, value: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.stores.entry(key.to_string()).or_default() += 1;
        state.local_meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.state.lock().unwrap().local_meta.remove(key);
        Ok(())
    }

    fn shard_for(&self, key: &str, num_shards: u32) -> u32 {
        hash_shard(key, num_shards)
    }
}

#[async_trait]
impl ObjectFetcher for FakeZone {
    async fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        _instance: Option<&str>,
    ) -> Result<Option<RemoteObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .get(bucket)
            .and_then(|objs| objs.get(key))
            .map(|(data, mtime)| RemoteObject {
                data: data.clone(),
                mtime_us: *mtime,
                versioned_epoch: None,
            }))
    }
}

/// Counts full-sync listing calls of a wrapped flow.
pub struct CountingFlow {
    pub inner: Arc<dyn ShardFlow>,
    pub list_full_calls: AtomicU64,
}

impl CountingFlow {
    pub fn new(inner: Arc<dyn ShardFlow>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            list_full_calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ShardFlow for CountingFlow {
    fn shard_id(&self) -> &str {
        self.inner.shard_id()
    }
    fn status_key(&self) -> String {
        self.inner.status_key()
    }
    fn marker_window(&self) -> usize {
        self.inner.marker_window()
    }
    async fn list_full(&self, marker: &str, max: usize) -> Result<Vec<LogEntry>> {
        self.list_full_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_full(marker, max).await
    }
    async fn head(&self) -> Result<ShardInfo> {
        self.inner.head().await
    }
    async fn list_log(&self, marker: &str, max: usize) -> Result<LogPage> {
        self.inner.list_log(marker, max).await
    }
    fn accept(&self, entry: &LogEntry) -> bool {
        self.inner.accept(entry)
    }
    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        self.inner.apply(entry).await
    }
}

/// Flow whose applies block until the gate opens, tracking concurrency.
pub struct GatedFlow {
    gate: watch::Sender<bool>,
    running: AtomicUsize,
    peak: AtomicUsize,
    applied: Mutex<Vec<LogEntry>>,
}

impl GatedFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: watch::channel(false).0,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        })
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Most applies ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Entries applied so far, in completion order.
    pub fn applied(&self) -> Vec<LogEntry> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardFlow for GatedFlow {
    fn shard_id(&self) -> &str {
        "gated"
    }
    fn status_key(&self) -> String {
        "gated.sync-status".into()
    }
    fn marker_window(&self) -> usize {
        1
    }
    async fn list_full(&self, _marker: &str, _max: usize) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }
    async fn head(&self) -> Result<ShardInfo> {
        Ok(ShardInfo::default())
    }
    async fn list_log(&self, _marker: &str, _max: usize) -> Result<LogPage> {
        Ok(LogPage::default())
    }
    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.map(|_| ());
        self.running.fetch_sub(1, Ordering::SeqCst);
        opened.map_err(|_| SyncError::again("gate dropped"))?;
        self.applied.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Builds the context a phase runs with.
pub fn shard_context(
    flow: Arc<dyn ShardFlow>,
    store: Arc<MemoryStore>,
    config: SyncConfig,
) -> ShardContext {
    let records = RecordStore::new(store);
    let handle = Arc::new(ShardHandle::new(flow.shard_id(), flow.status_key()));
    let error_log = Arc::new(SyncErrorLog::new(records.clone(), config.error_log_shards));
    let applier = Arc::new(SingleEntryApplier::new(
        flow.clone(),
        error_log,
        handle.clone(),
        config.transient_retries,
    ));
    ShardContext {
        flow,
        records,
        config: Arc::new(config),
        applier,
        handle,
        cancel: CancellationToken::new(),
    }
}

/// Polls `check` once per virtual second until it holds.
pub async fn wait_for<F: FnMut() -> bool>(max_secs: u64, mut check: F) -> bool {
    for _ in 0..max_secs {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    check()
}
