//! What a shard replicates, as seen by the generic sync phases.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::applier::SingleEntryApplier;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::registry::ShardHandle;
use crate::remote::LogPage;
use crate::store::RecordStore;
use crate::types::{EntryOp, LogEntry, ShardInfo};

/// Sources and apply logic of one shard.
///
/// Implemented once for metadata log shards and once for bucket pipe shards.
#[async_trait]
pub trait ShardFlow: Send + Sync {
    /// Id used for routing wake-ups and in logs.
    fn shard_id(&self) -> &str;

    /// Record key of the shard's [`crate::types::SyncMarker`], also its lease name.
    fn status_key(&self) -> String;

    /// Completions between marker persists.
    fn marker_window(&self) -> usize;

    /// Full-sync inventory entries after `marker`. A short page ends the listing.
    async fn list_full(&self, marker: &str, max: usize) -> Result<Vec<LogEntry>>;

    /// Head of the remote log shard.
    async fn head(&self) -> Result<ShardInfo>;

    /// Log entries after `marker`.
    async fn list_log(&self, marker: &str, max: usize) -> Result<LogPage>;

    /// Whether an entry should be applied at all.
    fn accept(&self, entry: &LogEntry) -> bool {
        entry.op != EntryOp::Cancel
    }

    /// Entry used to sync a key reported out of band. It goes through
    /// [`Self::accept`] like any log entry.
    fn modified_entry(&self, key: &str) -> LogEntry {
        LogEntry::write("", key)
    }

    /// One attempt at replicating `entry` locally. Must be safe to repeat.
    async fn apply(&self, entry: &LogEntry) -> Result<()>;
}

/// Everything a phase needs to run one shard.
#[derive(Clone)]
pub struct ShardContext {
    /// What is replicated.
    pub flow: Arc<dyn ShardFlow>,
    /// Local status records.
    pub records: RecordStore,
    /// Engine settings.
    pub config: Arc<SyncConfig>,
    /// Per-entry apply with retry.
    pub applier: Arc<SingleEntryApplier>,
    /// Wake-ups and counters.
    pub handle: Arc<ShardHandle>,
    /// Graceful shutdown.
    pub cancel: CancellationToken,
}
