//! Metadata replication: one shard per remote metadata log shard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::backend::MetadataBackend;
use crate::config::SyncConfig;
use crate::controller::{SyncController, SyncPlan};
use crate::error::Result;
use crate::flow::ShardFlow;
use crate::remote::{LogPage, LogShard, RemoteInventory, RemoteLog};
use crate::status::{full_sync_index_prefix, meta_shard_key, META_INFO_KEY};
use crate::store::RecordStore;
use crate::types::{LogEntry, ShardInfo};

/// Controller replicating zone metadata.
pub type ZoneSyncController = SyncController<MetadataPlan>;

const SECTION_ORDER: [&str; 3] = ["user", "bucket.instance", "bucket"];

/// Orders sections so that owners replicate before what they own.
pub fn order_sections(mut sections: Vec<String>) -> Vec<String> {
    sections.sort();
    sections.dedup();
    let mut ordered: Vec<String> = SECTION_ORDER
        .iter()
        .filter(|s| sections.iter().any(|x| x == *s))
        .map(|s| s.to_string())
        .collect();
    ordered.extend(
        sections
            .into_iter()
            .filter(|s| !SECTION_ORDER.contains(&s.as_str())),
    );
    ordered
}

/// Index record name for `section:name` at section rank `rank`.
fn index_entry(rank: usize, key: &str) -> String {
    format!("{:03}|{}", rank, key)
}

/// Plan for metadata: shards come from the remote metadata log.
pub struct MetadataPlan {
    log: Arc<dyn RemoteLog>,
    inventory: Arc<dyn RemoteInventory>,
    backend: Arc<dyn MetadataBackend>,
    records: RecordStore,
    config: Arc<SyncConfig>,
}

impl MetadataPlan {
    /// Creates the plan. `records` is where the full-sync index lives.
    pub fn new(
        log: Arc<dyn RemoteLog>,
        inventory: Arc<dyn RemoteInventory>,
        backend: Arc<dyn MetadataBackend>,
        records: RecordStore,
        config: &SyncConfig,
    ) -> Self {
        Self {
            log,
            inventory,
            backend,
            records,
            config: Arc::new(config.clone()),
        }
    }

    fn flow(&self, shard: u32) -> Arc<dyn ShardFlow> {
        Arc::new(MetaShardFlow {
            shard,
            shard_id: shard.to_string(),
            log: self.log.clone(),
            backend: self.backend.clone(),
            records: self.records.clone(),
            window: self.config.meta_marker_window,
        })
    }
}

#[async_trait]
impl SyncPlan for MetadataPlan {
    fn name(&self) -> String {
        "metadata".to_string()
    }

    fn info_key(&self) -> String {
        META_INFO_KEY.to_string()
    }

    async fn targets(&self) -> Result<Vec<Arc<dyn ShardFlow>>> {
        let num_shards = self.log.num_meta_shards().await?;
        Ok((0..num_shards).map(|n| self.flow(n)).collect())
    }

    async fn build_full_sync_maps(
        &self,
        targets: &[Arc<dyn ShardFlow>],
    ) -> Result<HashMap<String, u64>> {
        let num_shards = targets.len() as u32;
        let page_size = self.config.full_sync_page_size;
        let sections = order_sections(self.inventory.list_sections().await?);
        let mut totals: HashMap<String, u64> = HashMap::new();

        for (rank, section) in sections.iter().enumerate() {
            let mut marker = String::new();
            loop {
                let page = self.inventory.list_keys(section, &marker, page_size).await?;
                for name in &page.keys {
                    let key = format!("{}:{}", section, name);
                    let shard = self.backend.shard_for(&key, num_shards);
                    let record = format!("{}{}", full_sync_index_prefix(shard), index_entry(rank, &key));
                    self.records
                        .raw()
                        .write_record(&record, Bytes::new(), None, false)
                        .await?;
                    *totals.entry(shard.to_string()).or_default() += 1;
                }
                match page.keys.last() {
                    Some(last) if page.truncated => marker = last.clone(),
                    _ => break,
                }
            }
            debug!(%section, "indexed metadata section");
        }
        info!(
            sections = sections.len(),
            entries = totals.values().sum::<u64>(),
            "metadata full sync index built"
        );
        Ok(totals)
    }
}

/// One metadata log shard.
pub struct MetaShardFlow {
    shard: u32,
    shard_id: String,
    log: Arc<dyn RemoteLog>,
    backend: Arc<dyn MetadataBackend>,
    records: RecordStore,
    window: usize,
}

#[async_trait]
impl ShardFlow for MetaShardFlow {
    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    fn status_key(&self) -> String {
        meta_shard_key(self.shard)
    }

    fn marker_window(&self) -> usize {
        self.window
    }

    async fn list_full(&self, marker: &str, max: usize) -> Result<Vec<LogEntry>> {
        let names = self
            .records
            .list_keys(&full_sync_index_prefix(self.shard), marker, max)
            .await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let key = name
                    .split_once('|')
                    .map(|(_, k)| k.to_string())
                    .unwrap_or_else(|| name.clone());
                LogEntry::write(name, key)
            })
            .collect())
    }

    async fn head(&self) -> Result<ShardInfo> {
        self.log.shard_info(&LogShard::Metadata(self.shard)).await
    }

    async fn list_log(&self, marker: &str, max: usize) -> Result<LogPage> {
        self.log
            .list_entries(&LogShard::Metadata(self.shard), marker, max)
            .await
    }

    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        match self.backend.fetch(&entry.key).await? {
            Some(value) => {
                debug!(shard = self.shard, key = %entry.key, "storing metadata");
                self.backend.store(&entry.key, value).await
            }
            None => {
                debug!(shard = self.shard, key = %entry.key, "removing metadata");
                self.backend.remove(&entry.key).await
            }
        }
    }
}
