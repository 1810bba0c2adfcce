//! Top-level sync controller: bootstrap, inventory maps, then one
//! supervised machine per shard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::applier::SingleEntryApplier;
use crate::backoff::{BackoffReset, BackoffSupervisor, Supervised};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::error_log::SyncErrorLog;
use crate::flow::{ShardContext, ShardFlow};
use crate::lease::{LeaseBackend, LeaseManager};
use crate::registry::ShardRegistry;
use crate::shard::ShardSyncStateMachine;
use crate::status::{ShardStatus, SyncInfo, ZoneSyncState};
use crate::store::{LocalStore, RecordStore, Versioned};
use crate::types::{SyncMarker, SyncState};

/// What a controller replicates: its shards and how to count their inventory.
#[async_trait]
pub trait SyncPlan: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> String;

    /// Key of the controller's [`SyncInfo`] record, also its lease name.
    fn info_key(&self) -> String;

    /// The shards to run.
    async fn targets(&self) -> Result<Vec<Arc<dyn ShardFlow>>>;

    /// Crawls the full inventory once. Returns the entry count per shard id.
    async fn build_full_sync_maps(
        &self,
        targets: &[Arc<dyn ShardFlow>],
    ) -> Result<HashMap<String, u64>>;
}

/// Shared pieces handed from a controller to the handle it returns.
struct Shared {
    records: RecordStore,
    registry: Arc<ShardRegistry>,
    error_log: Arc<SyncErrorLog>,
    cancel: CancellationToken,
}

/// Generic controller over a [`SyncPlan`].
pub struct SyncController<P: SyncPlan> {
    plan: Arc<P>,
    leases: Arc<dyn LeaseBackend>,
    config: Arc<SyncConfig>,
    shared: Arc<Shared>,
}

impl<P: SyncPlan> SyncController<P> {
    /// Creates a controller persisting into `store` and locking through `leases`.
    pub fn new(
        plan: P,
        store: Arc<dyn LocalStore>,
        leases: Arc<dyn LeaseBackend>,
        config: SyncConfig,
    ) -> Self {
        let records = RecordStore::new(store);
        let error_log = Arc::new(SyncErrorLog::new(records.clone(), config.error_log_shards));
        Self {
            plan: Arc::new(plan),
            leases,
            config: Arc::new(config),
            shared: Arc::new(Shared {
                records,
                registry: Arc::new(ShardRegistry::new()),
                error_log,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The plan this controller runs.
    pub fn plan(&self) -> &Arc<P> {
        &self.plan
    }

    /// Starts the controller under its own backoff supervisor.
    pub fn start(mut self) -> ZoneSyncHandle {
        let shared = self.shared.clone();
        let max_backoff = self.config.backoff_max();
        let task = tokio::spawn(async move {
            let mut supervisor = BackoffSupervisor::new(max_backoff, self.shared.cancel.clone());
            supervisor.run(&mut self).await
        });
        ZoneSyncHandle { shared, task }
    }

    async fn read_info(&self) -> Result<Versioned<SyncInfo>> {
        let key = self.plan.info_key();
        if let Some(info) = self.shared.records.read::<SyncInfo>(&key).await? {
            return Ok(info);
        }
        let info = SyncInfo::default();
        let version = self.shared.records.create(&key, &info).await?;
        Ok(Versioned {
            value: info,
            version,
        })
    }

    async fn lock_info(&self) -> Result<LeaseManager> {
        let mut lease = LeaseManager::acquire(
            self.leases.clone(),
            self.plan.info_key(),
            self.config.lease_period(),
            self.config.lease_renew_interval(),
        );
        lease.wait_locked().await?;
        Ok(lease)
    }

    async fn write_info(&self, lease: &LeaseManager, info: &mut Versioned<SyncInfo>) -> Result<()> {
        lease.check()?;
        info.version = self
            .shared
            .records
            .write(&self.plan.info_key(), &info.value, Some(info.version))
            .await?;
        Ok(())
    }

    /// Creates every shard marker at the shard's current remote head.
    async fn init(&self, info: &mut Versioned<SyncInfo>) -> Result<()> {
        let lease = self.lock_info().await?;
        let result = async {
            let targets = self.plan.targets().await?;
            for flow in &targets {
                let head = flow.head().await?;
                let key = flow.status_key();
                let marker = SyncMarker::new_full_sync(head.head_marker);
                let expected = self
                    .shared
                    .records
                    .read::<SyncMarker>(&key)
                    .await?
                    .map(|m| m.version);
                lease.check()?;
                self.shared.records.write(&key, &marker, expected).await?;
            }
            info.value.state = ZoneSyncState::BuildingFullSyncMaps;
            info.value.num_shards = targets.len() as u32;
            self.write_info(&lease, info).await
        }
        .await;
        lease.go_down().await;
        if result.is_ok() {
            info!(controller = %self.plan.name(), shards = info.value.num_shards, "initialized sync status");
        }
        result
    }

    /// Counts each shard's inventory and moves to [`ZoneSyncState::Sync`].
    async fn build_maps(&self, info: &mut Versioned<SyncInfo>) -> Result<()> {
        let lease = self.lock_info().await?;
        let result = async {
            let targets = self.plan.targets().await?;
            let totals = self.plan.build_full_sync_maps(&targets).await?;
            for flow in &targets {
                let key = flow.status_key();
                let Some(mut marker) = self.shared.records.read::<SyncMarker>(&key).await? else {
                    continue;
                };
                marker.value.total_entries = totals.get(flow.shard_id()).copied().unwrap_or(0);
                lease.check()?;
                self.shared
                    .records
                    .write(&key, &marker.value, Some(marker.version))
                    .await?;
            }
            info.value.state = ZoneSyncState::Sync;
            self.write_info(&lease, info).await
        }
        .await;
        lease.go_down().await;
        if result.is_ok() {
            info!(controller = %self.plan.name(), "built full sync maps");
        }
        result
    }

    /// Runs every shard until shutdown or a fatal shard error.
    async fn run_shards(&self, reset: &BackoffReset) -> Result<()> {
        let targets = self.plan.targets().await?;
        let round = self.shared.cancel.child_token();
        let mut shards = JoinSet::new();

        for flow in targets {
            let handle = self
                .shared
                .registry
                .register(flow.shard_id(), &flow.status_key());
            let applier = Arc::new(SingleEntryApplier::new(
                flow.clone(),
                self.shared.error_log.clone(),
                handle.clone(),
                self.config.transient_retries,
            ));
            let ctx = ShardContext {
                flow,
                records: self.shared.records.clone(),
                config: self.config.clone(),
                applier,
                handle,
                cancel: round.clone(),
            };
            let mut machine = ShardSyncStateMachine::new(ctx, self.leases.clone());
            let mut supervisor = BackoffSupervisor::new(self.config.backoff_max(), round.clone());
            shards.spawn(async move { supervisor.run(&mut machine).await });
        }
        info!(controller = %self.plan.name(), shards = shards.len(), "shards started");
        reset.signal();

        let mut outcome = Ok(());
        while let Some(joined) = shards.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(SyncError::InvalidState {
                    msg: format!("shard task died: {}", e),
                })
            });
            if let Err(e) = result {
                error!(controller = %self.plan.name(), error = %e, "shard stopped, stopping controller");
                round.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl<P: SyncPlan> Supervised for SyncController<P> {
    fn name(&self) -> String {
        format!("controller {}", self.plan.name())
    }

    async fn run_once(&mut self, reset: &BackoffReset) -> Result<()> {
        let mut info = self.read_info().await?;
        loop {
            if self.shared.cancel.is_cancelled() {
                return Ok(());
            }
            match info.value.state {
                ZoneSyncState::Init => self.init(&mut info).await?,
                ZoneSyncState::BuildingFullSyncMaps => self.build_maps(&mut info).await?,
                ZoneSyncState::Sync => return self.run_shards(reset).await,
            }
        }
    }
}

/// Handle to a running controller.
pub struct ZoneSyncHandle {
    shared: Arc<Shared>,
    task: JoinHandle<Result<()>>,
}

impl ZoneSyncHandle {
    /// Queues `keys` for out-of-band sync on `shard`. Unknown shards are ignored.
    pub fn wakeup(&self, shard: &str, keys: Vec<String>) -> bool {
        self.shared.registry.wakeup(shard, keys)
    }

    /// Ids of the running shards.
    pub fn shard_ids(&self) -> Vec<String> {
        self.shared
            .registry
            .handles()
            .iter()
            .map(|h| h.id().to_string())
            .collect()
    }

    /// The controller's error log.
    pub fn error_log(&self) -> &Arc<SyncErrorLog> {
        &self.shared.error_log
    }

    /// Status of every registered shard.
    pub async fn status(&self) -> Result<Vec<ShardStatus>> {
        let mut out = Vec::new();
        for handle in self.shared.registry.handles() {
            let Some(marker) = self
                .shared
                .records
                .read::<SyncMarker>(handle.status_key())
                .await?
            else {
                continue;
            };
            let m = marker.value;
            let head_marker = handle.head_marker();
            let failed_entries = handle.failed_entries();
            let behind = match m.state {
                SyncState::FullSync => true,
                SyncState::IncrementalSync => m.marker < head_marker,
            };
            out.push(ShardStatus {
                shard: handle.id().to_string(),
                state: m.state,
                marker: m.marker,
                head_marker,
                pos: m.pos,
                total_entries: m.total_entries,
                lagging: behind || failed_entries > 0,
                failed_entries,
            });
        }
        Ok(out)
    }

    /// True once the controller task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops gracefully: shards drain, persist and release their leases.
    pub async fn shutdown(self) -> Result<()> {
        self.shared.cancel.cancel();
        self.join().await
    }

    /// Waits for the controller to stop on its own.
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(|e| SyncError::InvalidState {
            msg: format!("controller task died: {}", e),
        })?
    }

    /// Stops immediately without waiting for in-flight work.
    pub fn abort(self) {
        self.shared.cancel.cancel();
        self.task.abort();
    }
}
