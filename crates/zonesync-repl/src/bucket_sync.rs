//! Bucket data replication along configured pipes.
//!
//! Every source bucket index shard feeding a destination bucket is one
//! shard of the controller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::controller::{SyncController, SyncPlan};
use crate::error::Result;
use crate::flow::ShardFlow;
use crate::policy::{group_pipes, PipeGroup, PipeRules, SyncPolicyPipe};
use crate::remote::{LogPage, LogShard, RemoteInventory, RemoteLog};
use crate::sink::{BucketInfo, DataSink, ObjectRef};
use crate::status::{bucket_info_key, bucket_shard_key};
use crate::types::{EntryOp, EntryStatus, LogEntry, ShardInfo};

/// Controller replicating bucket data along pipes.
pub type BucketPipeController = SyncController<BucketPipePlan>;

/// Plan for bucket pipes delivering into the local zone.
pub struct BucketPipePlan {
    name: String,
    groups: Vec<PipeGroup>,
    log: Arc<dyn RemoteLog>,
    inventory: Arc<dyn RemoteInventory>,
    sink: Arc<dyn DataSink>,
    config: Arc<SyncConfig>,
}

impl BucketPipePlan {
    /// Creates a plan named `name` for the pipes that deliver into `local_zone`.
    pub fn new(
        name: impl Into<String>,
        local_zone: &str,
        pipes: &[SyncPolicyPipe],
        log: Arc<dyn RemoteLog>,
        inventory: Arc<dyn RemoteInventory>,
        sink: Arc<dyn DataSink>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            name: name.into(),
            groups: group_pipes(pipes, local_zone),
            log,
            inventory,
            sink,
            config: Arc::new(config.clone()),
        }
    }

    /// Source/destination pairs this plan replicates.
    pub fn groups(&self) -> &[PipeGroup] {
        &self.groups
    }
}

#[async_trait]
impl SyncPlan for BucketPipePlan {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn info_key(&self) -> String {
        bucket_info_key(&self.name)
    }

    async fn targets(&self) -> Result<Vec<Arc<dyn ShardFlow>>> {
        let mut flows: Vec<Arc<dyn ShardFlow>> = Vec::new();
        for group in &self.groups {
            let shards = self.inventory.bucket_shards(&group.source.bucket).await?;
            let rules = Arc::new(group.rules.clone());
            let bucket = BucketInfo {
                source_zone: group.source.zone.clone(),
                source_bucket: group.source.bucket.clone(),
                dest_bucket: group.dest_bucket.clone(),
            };
            for shard in 0..shards {
                flows.push(Arc::new(BucketShardFlow::new(
                    bucket.clone(),
                    shard,
                    rules.clone(),
                    self.log.clone(),
                    self.inventory.clone(),
                    self.sink.clone(),
                    self.config.bucket_marker_window,
                )));
            }
        }
        Ok(flows)
    }

    async fn build_full_sync_maps(
        &self,
        targets: &[Arc<dyn ShardFlow>],
    ) -> Result<HashMap<String, u64>> {
        let page_size = self.config.full_sync_page_size;
        let mut totals = HashMap::new();
        for flow in targets {
            let mut marker = String::new();
            let mut count = 0u64;
            loop {
                let page = flow.list_full(&marker, page_size).await?;
                count += page.iter().filter(|e| flow.accept(e)).count() as u64;
                match page.last() {
                    Some(last) if page.len() == page_size => marker = last.id.clone(),
                    _ => break,
                }
            }
            debug!(shard = %flow.shard_id(), count, "counted bucket shard");
            totals.insert(flow.shard_id().to_string(), count);
        }
        info!(controller = %self.name, shards = targets.len(), "bucket full sync maps built");
        Ok(totals)
    }
}

/// One index shard of a source bucket feeding one destination bucket.
pub struct BucketShardFlow {
    bucket: BucketInfo,
    shard: u32,
    shard_id: String,
    rules: Arc<PipeRules>,
    log: Arc<dyn RemoteLog>,
    inventory: Arc<dyn RemoteInventory>,
    sink: Arc<dyn DataSink>,
    window: usize,
}

impl BucketShardFlow {
    /// Creates the flow for `shard` of `bucket.source_bucket`.
    pub fn new(
        bucket: BucketInfo,
        shard: u32,
        rules: Arc<PipeRules>,
        log: Arc<dyn RemoteLog>,
        inventory: Arc<dyn RemoteInventory>,
        sink: Arc<dyn DataSink>,
        window: usize,
    ) -> Self {
        let shard_id = format!(
            "{}:{}:{}:{}",
            bucket.source_zone, bucket.source_bucket, bucket.dest_bucket, shard
        );
        Self {
            bucket,
            shard,
            shard_id,
            rules,
            log,
            inventory,
            sink,
            window,
        }
    }

    fn log_shard(&self) -> LogShard {
        LogShard::BucketIndex {
            bucket: self.bucket.source_bucket.clone(),
            shard: self.shard,
        }
    }
}

#[async_trait]
impl ShardFlow for BucketShardFlow {
    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    fn status_key(&self) -> String {
        bucket_shard_key(&self.shard_id)
    }

    fn marker_window(&self) -> usize {
        self.window
    }

    async fn list_full(&self, marker: &str, max: usize) -> Result<Vec<LogEntry>> {
        let page = self
            .inventory
            .list_objects(&self.bucket.source_bucket, self.shard, marker, max)
            .await?;
        Ok(page
            .objects
            .into_iter()
            .map(|obj| {
                let mut entry = LogEntry {
                    id: obj.position(),
                    key: obj.key,
                    timestamp_us: obj.mtime_us,
                    status: EntryStatus::Complete,
                    op: EntryOp::Write,
                    versioned_epoch: obj.versioned_epoch,
                    instance: obj.instance,
                    owner: None,
                    tags: obj.tags,
                };
                if entry.is_versioned_instance() {
                    entry.op = EntryOp::LinkOlh;
                }
                entry
            })
            .collect())
    }

    async fn head(&self) -> Result<ShardInfo> {
        self.log.shard_info(&self.log_shard()).await
    }

    async fn list_log(&self, marker: &str, max: usize) -> Result<LogPage> {
        self.log.list_entries(&self.log_shard(), marker, max).await
    }

    fn accept(&self, entry: &LogEntry) -> bool {
        if entry.op == EntryOp::Cancel || entry.key.starts_with('_') {
            return false;
        }
        self.rules.select(&entry.key, &entry.tags).is_some()
    }

    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        let obj = ObjectRef {
            key: entry.key.clone(),
            instance: entry.instance.clone(),
            versioned_epoch: entry.versioned_epoch,
            mtime_us: entry.timestamp_us,
        };
        match entry.op {
            EntryOp::Write if entry.is_versioned_instance() => {
                debug!(shard = %self.shard_id, key = %entry.key, "versioned write synced on link");
                Ok(())
            }
            EntryOp::Write | EntryOp::LinkOlh => self.sink.sync_object(&self.bucket, &obj).await,
            EntryOp::Delete => self.sink.remove_object(&self.bucket, &obj, false).await,
            EntryOp::UnlinkInstance => self.sink.remove_object(&self.bucket, &obj, true).await,
            EntryOp::LinkOlhDeleteMarker => {
                self.sink.create_delete_marker(&self.bucket, &obj).await
            }
            EntryOp::Cancel => Ok(()),
        }
    }
}
