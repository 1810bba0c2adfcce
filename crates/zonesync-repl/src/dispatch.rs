//! Bounded concurrent dispatch of entries with watermark persistence.
//!
//! Shared by both sync phases. The dispatcher owns the shard's marker
//! tracker and the set of running appliers, and writes the shard's
//! [`SyncMarker`] whenever the tracker reports a safe position.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::applier::{ApplyOutcome, SingleEntryApplier};
use crate::error::{Result, SyncError};
use crate::flow::ShardContext;
use crate::lease::LeaseManager;
use crate::marker::{MarkerTracker, PersistAction};
use crate::store::Versioned;
use crate::types::{now_us, LogEntry, SyncMarker};

struct ChildDone {
    key: String,
    pos: Option<String>,
    outcome: ApplyOutcome,
}

/// A coalesced entry waiting for a free slot in the spawn window.
struct Rerun {
    entry: LogEntry,
    key: String,
    pos: Option<String>,
}

/// Runs appliers for one shard within the spawn window.
pub struct EntryDispatcher {
    ctx: ShardContext,
    status_key: String,
    tracker: MarkerTracker<String, String, LogEntry>,
    children: JoinSet<ChildDone>,
    reruns: VecDeque<Rerun>,
    marker: Versioned<SyncMarker>,
    stalled: Option<SyncError>,
}

impl EntryDispatcher {
    /// Creates a dispatcher persisting into `marker`.
    pub fn new(ctx: &ShardContext, marker: Versioned<SyncMarker>) -> Self {
        Self {
            status_key: ctx.flow.status_key(),
            tracker: MarkerTracker::new(ctx.flow.marker_window()),
            ctx: ctx.clone(),
            children: JoinSet::new(),
            reruns: VecDeque::new(),
            marker,
            stalled: None,
        }
    }

    /// The marker as last persisted.
    pub fn marker(&self) -> &Versioned<SyncMarker> {
        &self.marker
    }

    /// Consumes the dispatcher, returning the last persisted marker.
    pub fn into_marker(self) -> Versioned<SyncMarker> {
        self.marker
    }

    /// Error of an entry that must be replayed, if any.
    pub fn stalled(&self) -> Option<&SyncError> {
        self.stalled.as_ref()
    }

    /// Number of running appliers.
    pub fn in_flight(&self) -> usize {
        self.children.len()
    }

    /// Dispatches a positioned entry.
    ///
    /// Entries whose key is already in flight are stashed and re-run once the
    /// running operation completes. Their position is not persisted before
    /// that re-run has finished.
    pub async fn dispatch(
        &mut self,
        lease: &LeaseManager,
        entry: LogEntry,
        ordinal: u64,
    ) -> Result<()> {
        let pos = entry.id.clone();
        if self.tracker.is_pending(&pos) {
            debug!(shard = %self.ctx.flow.shard_id(), %pos, "duplicate position ignored");
            return Ok(());
        }
        let key = entry.sync_key();
        if !self.tracker.index_key_to_marker(key.clone(), pos.clone()) {
            if self.tracker.attach_marker(&key, pos.clone()) {
                // The key is held by a sync with no position. Keep this one
                // pending until the re-run finishes.
                debug!(shard = %self.ctx.flow.shard_id(), %key, %pos, "key held by modified-key sync, deferring");
                self.tracker.start(pos, ordinal, entry.timestamp_us);
            } else {
                debug!(shard = %self.ctx.flow.shard_id(), %key, %pos, "key in flight, deferring");
                self.tracker
                    .try_update_high_marker(pos, ordinal, entry.timestamp_us);
            }
            self.tracker.set_need_retry(key, entry);
            return Ok(());
        }
        self.tracker.start(pos.clone(), ordinal, entry.timestamp_us);
        self.spawn(lease, entry, key, Some(pos)).await
    }

    /// Dispatches an entry that has no log position.
    pub async fn dispatch_untracked(&mut self, lease: &LeaseManager, entry: LogEntry) -> Result<()> {
        let key = entry.sync_key();
        if !self.tracker.index_untracked(key.clone()) {
            // A stashed log entry already re-runs the key.
            let stashed = self.tracker.take_need_retry(&key).unwrap_or(entry);
            self.tracker.set_need_retry(key, stashed);
            return Ok(());
        }
        self.spawn(lease, entry, key, None).await
    }

    /// Counts a position as done without applying anything.
    pub fn skip(&mut self, entry: &LogEntry, ordinal: u64) {
        self.tracker
            .try_update_high_marker(entry.id.clone(), ordinal, entry.timestamp_us);
    }

    /// Handles every applier that already finished.
    pub async fn reap_ready(&mut self, lease: &LeaseManager) -> Result<()> {
        while let Some(joined) = self.children.try_join_next() {
            self.on_joined(lease, joined).await?;
        }
        self.start_queued();
        Ok(())
    }

    /// Waits for every running and queued applier, persisting as positions
    /// complete.
    pub async fn drain(&mut self, lease: &LeaseManager) -> Result<()> {
        loop {
            self.start_queued();
            match self.children.join_next().await {
                Some(joined) => self.on_joined(lease, joined).await?,
                None => return Ok(()),
            }
        }
    }

    /// Persists the watermark if it moved.
    pub async fn flush(&mut self, lease: &LeaseManager) -> Result<()> {
        if let Some(action) = self.tracker.flush() {
            self.persist(lease, action).await?;
        }
        Ok(())
    }

    /// Stops after `err`: waits for running appliers, keeping what is safe
    /// if the lease is still held, and returns `err`.
    pub async fn bail(&mut self, lease: &LeaseManager, err: SyncError) -> SyncError {
        if lease.is_locked() {
            let drained = match self.drain(lease).await {
                Ok(()) => self.flush(lease).await,
                Err(e) => Err(e),
            };
            if let Err(e) = drained {
                warn!(shard = %self.ctx.flow.shard_id(), error = %e, "drain after failure failed");
            }
        }
        while self.children.join_next().await.is_some() {}
        err
    }

    /// Writes a new marker value under the current version.
    pub async fn persist_marker(&mut self, lease: &LeaseManager, marker: SyncMarker) -> Result<()> {
        lease.check()?;
        let version = self
            .ctx
            .records
            .write(&self.status_key, &marker, Some(self.marker.version))
            .await?;
        self.marker = Versioned {
            value: marker,
            version,
        };
        Ok(())
    }

    async fn spawn(
        &mut self,
        lease: &LeaseManager,
        entry: LogEntry,
        key: String,
        pos: Option<String>,
    ) -> Result<()> {
        loop {
            self.start_queued();
            if self.children.len() < self.window() {
                break;
            }
            match self.children.join_next().await {
                Some(joined) => self.on_joined(lease, joined).await?,
                None => break,
            }
        }
        self.spawn_child(entry, key, pos);
        Ok(())
    }

    fn window(&self) -> usize {
        self.ctx.config.spawn_window.max(1)
    }

    /// Starts queued re-runs while the window has room.
    fn start_queued(&mut self) {
        if self.stalled.is_some() {
            self.reruns.clear();
            return;
        }
        while self.children.len() < self.window() {
            let Some(rerun) = self.reruns.pop_front() else {
                break;
            };
            self.spawn_child(rerun.entry, rerun.key, rerun.pos);
        }
    }

    fn spawn_child(&mut self, entry: LogEntry, key: String, pos: Option<String>) {
        let applier: Arc<SingleEntryApplier> = self.ctx.applier.clone();
        self.children.spawn(async move {
            let outcome = applier.apply(&entry).await;
            ChildDone { key, pos, outcome }
        });
    }

    async fn on_joined(
        &mut self,
        lease: &LeaseManager,
        joined: std::result::Result<ChildDone, tokio::task::JoinError>,
    ) -> Result<()> {
        let done = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(shard = %self.ctx.flow.shard_id(), error = %e, "applier task died");
                self.stalled
                    .get_or_insert_with(|| SyncError::again(format!("applier task died: {}", e)));
                return Ok(());
            }
        };

        if let ApplyOutcome::RetryLater(err) = done.outcome {
            self.stalled.get_or_insert(err);
            return Ok(());
        }

        if let Some(newer) = self.tracker.take_need_retry(&done.key) {
            if self.stalled.is_none() {
                debug!(shard = %self.ctx.flow.shard_id(), key = %done.key, "re-running coalesced entry");
                let pos = self.tracker.key_marker(&done.key).cloned();
                self.reruns.push_back(Rerun {
                    entry: newer,
                    key: done.key,
                    pos,
                });
            }
            return Ok(());
        }

        match done.pos {
            Some(pos) => {
                if let Some(action) = self.tracker.finish(&pos) {
                    self.persist(lease, action).await?;
                }
            }
            None => self.tracker.release_key(&done.key),
        }
        Ok(())
    }

    async fn persist(&mut self, lease: &LeaseManager, action: PersistAction<String>) -> Result<()> {
        let mut next = self.marker.value.clone();
        next.marker = action.marker;
        next.pos = action.ordinal;
        next.timestamp_us = if action.timestamp_us > 0 {
            action.timestamp_us
        } else {
            now_us()
        };
        self.persist_marker(lease, next).await?;
        info!(
            shard = %self.ctx.flow.shard_id(),
            state = %self.marker.value.state,
            marker = %self.marker.value.marker,
            pos = self.marker.value.pos,
            "persisted sync marker"
        );
        Ok(())
    }
}
