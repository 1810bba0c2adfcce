//! Idempotent apply of a single replicated entry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::error_log::SyncErrorLog;
use crate::flow::ShardFlow;
use crate::registry::ShardHandle;
use crate::types::LogEntry;

/// Result of applying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Replicated.
    Applied,
    /// Nothing to do, e.g. the source has not completed the operation.
    Skipped,
    /// Gave up on the entry, including after the transient retry budget ran
    /// out; it is recorded in the error log.
    Failed(SyncError),
    /// Ownership of the shard was lost mid-apply; replay it under a new lease.
    RetryLater(SyncError),
}

impl ApplyOutcome {
    /// True if the entry's position may be counted as done.
    pub fn is_finished(&self) -> bool {
        !matches!(self, ApplyOutcome::RetryLater(_))
    }
}

/// Applies entries through a [`ShardFlow`], retrying transient errors.
pub struct SingleEntryApplier {
    flow: Arc<dyn ShardFlow>,
    error_log: Arc<SyncErrorLog>,
    handle: Arc<ShardHandle>,
    max_attempts: u32,
}

impl SingleEntryApplier {
    /// Creates an applier that tries each entry at most `max_attempts` times.
    pub fn new(
        flow: Arc<dyn ShardFlow>,
        error_log: Arc<SyncErrorLog>,
        handle: Arc<ShardHandle>,
        max_attempts: u32,
    ) -> Self {
        Self {
            flow,
            error_log,
            handle,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Applies `entry`. Never fails the caller; the outcome says what happened.
    pub async fn apply(&self, entry: &LogEntry) -> ApplyOutcome {
        let shard = self.flow.shard_id();
        if !entry.is_complete() {
            debug!(shard, key = %entry.key, id = %entry.id, "skipping incomplete entry");
            return ApplyOutcome::Skipped;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.flow.apply(entry).await {
                Ok(()) => {
                    self.handle.record_applied();
                    return ApplyOutcome::Applied;
                }
                Err(e) => e,
            };

            if err.is_transient() && attempt < self.max_attempts {
                debug!(shard, key = %entry.key, attempt, error = %err, "retrying entry");
                continue;
            }
            if err.is_ownership_loss() {
                warn!(shard, key = %entry.key, attempt, error = %err, "entry deferred");
                return ApplyOutcome::RetryLater(err);
            }

            warn!(shard, key = %entry.key, attempt, error = %err, "giving up on entry");
            self.handle.record_failure();
            if let Err(log_err) = self.error_log.record(shard, &entry.key, &err).await {
                warn!(shard, key = %entry.key, error = %log_err, "failed to record sync error");
            }
            return ApplyOutcome::Failed(err);
        }
    }
}
