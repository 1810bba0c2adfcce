//! Per-shard state machine: lease, full sync, then incremental sync.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::backoff::{BackoffReset, Supervised};
use crate::error::{Result, SyncError};
use crate::flow::ShardContext;
use crate::full_sync::FullSyncPhase;
use crate::incremental::IncrementalSyncPhase;
use crate::lease::{LeaseBackend, LeaseManager};
use crate::store::Versioned;
use crate::types::{SyncMarker, SyncState};

/// Drives one shard from its persisted state. Restarted by a
/// [`crate::backoff::BackoffSupervisor`] after every failure.
pub struct ShardSyncStateMachine {
    ctx: ShardContext,
    leases: Arc<dyn LeaseBackend>,
    marker: Option<Versioned<SyncMarker>>,
}

impl ShardSyncStateMachine {
    /// Creates a machine for the shard described by `ctx`.
    pub fn new(ctx: ShardContext, leases: Arc<dyn LeaseBackend>) -> Self {
        Self {
            ctx,
            leases,
            marker: None,
        }
    }

    /// Reads the shard's marker, creating it at the current remote head if missing.
    async fn load_marker(&self) -> Result<Versioned<SyncMarker>> {
        let key = self.ctx.flow.status_key();
        if let Some(marker) = self.ctx.records.read::<SyncMarker>(&key).await? {
            return Ok(marker);
        }
        let head = self.ctx.flow.head().await?;
        let marker = SyncMarker::new_full_sync(head.head_marker);
        let version = self.ctx.records.create(&key, &marker).await?;
        info!(shard = %self.ctx.flow.shard_id(), "initialized missing sync marker");
        Ok(Versioned {
            value: marker,
            version,
        })
    }

    async fn acquire_lease(&self, reset: &BackoffReset) -> Result<LeaseManager> {
        let mut lease = LeaseManager::acquire(
            self.leases.clone(),
            self.ctx.flow.status_key(),
            self.ctx.config.lease_period(),
            self.ctx.config.lease_renew_interval(),
        );
        let locked = tokio::select! {
            r = lease.wait_locked() => Some(r),
            _ = self.ctx.cancel.cancelled() => None,
        };
        match locked {
            None => {
                lease.abort();
                Err(SyncError::Shutdown)
            }
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                reset.signal();
                Ok(lease)
            }
        }
    }
}

#[async_trait]
impl Supervised for ShardSyncStateMachine {
    fn name(&self) -> String {
        format!("shard {}", self.ctx.flow.shard_id())
    }

    async fn run_once(&mut self, reset: &BackoffReset) -> Result<()> {
        let mut marker = match self.marker.take() {
            Some(m) => m,
            None => self.load_marker().await?,
        };

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let lease = self.acquire_lease(reset).await?;
            match marker.value.state {
                SyncState::FullSync => {
                    let result = FullSyncPhase::run(&self.ctx, &lease, marker).await;
                    lease.go_down().await;
                    marker = result?;
                }
                SyncState::IncrementalSync => {
                    let result = IncrementalSyncPhase::run(&self.ctx, &lease, marker).await;
                    lease.go_down().await;
                    return result;
                }
            }
        }
    }

    async fn finish_round(&mut self) -> Result<()> {
        self.marker = Some(self.load_marker().await?);
        Ok(())
    }
}
