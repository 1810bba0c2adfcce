//! Running shard machines, keyed by shard id, for wake-up routing and status.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

/// Shared state between a running shard machine and the outside world.
#[derive(Debug)]
pub struct ShardHandle {
    id: String,
    status_key: String,
    notify: Notify,
    modified: Mutex<BTreeSet<String>>,
    head_marker: Mutex<String>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl ShardHandle {
    /// Creates a handle for shard `id` persisted at `status_key`.
    pub fn new(id: impl Into<String>, status_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status_key: status_key.into(),
            notify: Notify::new(),
            modified: Mutex::new(BTreeSet::new()),
            head_marker: Mutex::new(String::new()),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Shard id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key of the shard's persisted marker.
    pub fn status_key(&self) -> &str {
        &self.status_key
    }

    /// Queues keys for out-of-band sync and interrupts the poll sleep.
    pub fn wakeup<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut modified) = self.modified.lock() {
            modified.extend(keys.into_iter().map(Into::into));
        }
        self.notify.notify_one();
    }

    /// Takes all queued keys.
    pub fn take_modified(&self) -> BTreeSet<String> {
        self.modified
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }

    /// Resolves on the next [`Self::wakeup`].
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Records the last observed remote head.
    pub fn set_head_marker(&self, head: &str) {
        if let Ok(mut h) = self.head_marker.lock() {
            if h.as_str() != head {
                h.clear();
                h.push_str(head);
            }
        }
    }

    /// Last observed remote head.
    pub fn head_marker(&self) -> String {
        self.head_marker
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Counts a successfully applied entry.
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an entry that failed terminally.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries applied since start.
    pub fn applied_entries(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Entries failed since start.
    pub fn failed_entries(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Registry of shard handles owned by one controller.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: DashMap<String, Arc<ShardHandle>>,
}

impl ShardRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `id`, creating it on first use.
    pub fn register(&self, id: &str, status_key: &str) -> Arc<ShardHandle> {
        self.shards
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ShardHandle::new(id, status_key)))
            .clone()
    }

    /// Handle for `id`.
    pub fn get(&self, id: &str) -> Option<Arc<ShardHandle>> {
        self.shards.get(id).map(|h| h.clone())
    }

    /// Forwards a wake-up. Returns false for unknown shards.
    pub fn wakeup(&self, id: &str, keys: Vec<String>) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.wakeup(keys);
                true
            }
            None => {
                debug!(shard = %id, "wakeup for unknown shard ignored");
                false
            }
        }
    }

    /// All handles, sorted by id.
    pub fn handles(&self) -> Vec<Arc<ShardHandle>> {
        let mut all: Vec<_> = self.shards.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Number of registered shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Returns true if no shard is registered.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
