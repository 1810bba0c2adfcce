//! Continuous log tailing for a shard.

use tracing::{debug, info};

use crate::dispatch::EntryDispatcher;
use crate::error::{Result, SyncError};
use crate::flow::ShardContext;
use crate::lease::LeaseManager;
use crate::store::Versioned;
use crate::types::{SyncMarker, SyncState};

/// Tails the remote log shard from the persisted marker.
pub struct IncrementalSyncPhase;

impl IncrementalSyncPhase {
    /// Runs until shutdown (`Ok`) or until the lease is lost or an
    /// unrecoverable error occurs.
    pub async fn run(
        ctx: &ShardContext,
        lease: &LeaseManager,
        marker: Versioned<SyncMarker>,
    ) -> Result<()> {
        if marker.value.state != SyncState::IncrementalSync {
            return Err(SyncError::InvalidState {
                msg: format!("{} is not in incremental sync", ctx.flow.status_key()),
            });
        }
        info!(
            shard = %ctx.flow.shard_id(),
            marker = %marker.value.marker,
            "starting incremental sync"
        );

        let mut dispatcher = EntryDispatcher::new(ctx, marker);
        if let Err(e) = Self::tail(ctx, lease, &mut dispatcher).await {
            return Err(dispatcher.bail(lease, e).await);
        }

        if let Err(e) = dispatcher.drain(lease).await {
            return Err(dispatcher.bail(lease, e).await);
        }
        dispatcher.flush(lease).await?;
        info!(
            shard = %ctx.flow.shard_id(),
            marker = %dispatcher.marker().value.marker,
            "incremental sync stopped"
        );
        Ok(())
    }

    async fn tail(
        ctx: &ShardContext,
        lease: &LeaseManager,
        dispatcher: &mut EntryDispatcher,
    ) -> Result<()> {
        let shard = ctx.flow.shard_id().to_string();
        let max_entries = ctx.config.incremental_max_entries;
        let mut position = dispatcher.marker().value.marker.clone();
        let mut ordinal = dispatcher.marker().value.pos;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            lease.check()?;
            if let Some(e) = dispatcher.stalled() {
                return Err(e.clone());
            }

            for key in ctx.handle.take_modified() {
                let entry = ctx.flow.modified_entry(&key);
                if !ctx.flow.accept(&entry) {
                    debug!(shard = %shard, %key, "ignoring modified key outside the shard's filter");
                    continue;
                }
                debug!(shard = %shard, %key, "syncing modified key");
                dispatcher.dispatch_untracked(lease, entry).await?;
            }

            let info = ctx.flow.head().await?;
            ctx.handle.set_head_marker(&info.head_marker);

            if position < info.head_marker {
                let page = ctx.flow.list_log(&position, max_entries).await?;
                if !page.entries.is_empty() {
                    debug!(
                        shard = %shard,
                        %position,
                        count = page.entries.len(),
                        truncated = page.truncated,
                        "listed log entries"
                    );
                    for entry in page.entries {
                        ordinal += 1;
                        position = entry.id.clone();
                        if !ctx.flow.accept(&entry) {
                            dispatcher.skip(&entry, ordinal);
                            continue;
                        }
                        dispatcher.dispatch(lease, entry, ordinal).await?;
                        if dispatcher.stalled().is_some() {
                            break;
                        }
                    }
                    dispatcher.reap_ready(lease).await?;
                    continue;
                }
            }

            // Caught up with the head: settle, persist, then poll.
            dispatcher.drain(lease).await?;
            dispatcher.flush(lease).await?;
            if let Some(e) = dispatcher.stalled() {
                return Err(e.clone());
            }
            debug!(shard = %shard, %position, "caught up, sleeping");
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = ctx.handle.notified() => {}
                _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
            }
        }
    }
}
