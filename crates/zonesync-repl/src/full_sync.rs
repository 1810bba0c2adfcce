//! One-time snapshot replication of a shard.

use tracing::{debug, info};

use crate::dispatch::EntryDispatcher;
use crate::error::{Result, SyncError};
use crate::flow::ShardContext;
use crate::lease::LeaseManager;
use crate::store::Versioned;
use crate::types::{SyncMarker, SyncState};

/// Pages through the shard's inventory and applies every entry.
pub struct FullSyncPhase;

impl FullSyncPhase {
    /// Runs full sync from `marker` while `lease` is held.
    ///
    /// On success the persisted marker has moved to incremental sync at
    /// the log position captured before the snapshot started.
    pub async fn run(
        ctx: &ShardContext,
        lease: &LeaseManager,
        marker: Versioned<SyncMarker>,
    ) -> Result<Versioned<SyncMarker>> {
        if marker.value.state != SyncState::FullSync {
            return Err(SyncError::InvalidState {
                msg: format!("{} is not in full sync", ctx.flow.status_key()),
            });
        }
        let shard = ctx.flow.shard_id().to_string();
        info!(
            shard = %shard,
            marker = %marker.value.marker,
            next_step_marker = %marker.value.next_step_marker,
            "starting full sync"
        );

        let mut dispatcher = EntryDispatcher::new(ctx, marker);
        if let Err(e) = Self::list_and_apply(ctx, lease, &mut dispatcher).await {
            return Err(dispatcher.bail(lease, e).await);
        }
        if let Err(e) = dispatcher.drain(lease).await {
            return Err(dispatcher.bail(lease, e).await);
        }
        dispatcher.flush(lease).await?;

        if let Some(e) = dispatcher.stalled() {
            return Err(e.clone());
        }
        if ctx.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }

        let mut next = dispatcher.marker().value.clone();
        next.complete_full_sync();
        dispatcher.persist_marker(lease, next).await?;
        info!(
            shard = %shard,
            marker = %dispatcher.marker().value.marker,
            "full sync complete, switching to incremental"
        );
        Ok(dispatcher.into_marker())
    }

    async fn list_and_apply(
        ctx: &ShardContext,
        lease: &LeaseManager,
        dispatcher: &mut EntryDispatcher,
    ) -> Result<()> {
        let page_size = ctx.config.full_sync_page_size;
        let mut position = dispatcher.marker().value.marker.clone();
        let mut ordinal = dispatcher.marker().value.pos;

        loop {
            if ctx.cancel.is_cancelled() || dispatcher.stalled().is_some() {
                return Ok(());
            }
            lease.check()?;

            let page = ctx.flow.list_full(&position, page_size).await?;
            let count = page.len();
            debug!(shard = %ctx.flow.shard_id(), %position, count, "listed full sync page");

            for entry in page {
                ordinal += 1;
                position = entry.id.clone();
                if !ctx.flow.accept(&entry) {
                    dispatcher.skip(&entry, ordinal);
                    continue;
                }
                dispatcher.dispatch(lease, entry, ordinal).await?;
                if dispatcher.stalled().is_some() {
                    return Ok(());
                }
            }
            dispatcher.reap_ready(lease).await?;

            if count < page_size {
                return Ok(());
            }
        }
    }
}
