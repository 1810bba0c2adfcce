//! Error types for the replication engine.

use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while replicating a zone.
///
/// Errors are `Clone` so a lease can capture the failure that ended it and
/// hand the same value to every phase that depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The lease is held by another owner.
    #[error("lease {name} is busy")]
    Busy {
        /// Lease name.
        name: String,
    },

    /// A held lease could not be renewed or was taken over.
    #[error("lease {name} lost: {reason}")]
    LeaseLost {
        /// Lease name.
        name: String,
        /// Why the lease was lost.
        reason: String,
    },

    /// Transient failure, the operation may be retried.
    #[error("temporarily unavailable: {reason}")]
    Again {
        /// Reason for the failure.
        reason: String,
    },

    /// The operation was canceled on the remote side.
    #[error("operation canceled: {reason}")]
    Canceled {
        /// Reason for the cancellation.
        reason: String,
    },

    /// Optimistic write lost a version race.
    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    Conflict {
        /// Record key.
        key: String,
        /// Version the writer expected.
        expected: Option<u64>,
        /// Version actually stored.
        found: Option<u64>,
    },

    /// A remote request timed out.
    #[error("request to {target} timed out after {timeout_ms}ms")]
    Timeout {
        /// The request target.
        target: String,
        /// Elapsed timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The remote zone could not be reached.
    #[error("remote zone unavailable: {msg}")]
    Unavailable {
        /// Error message describing the issue.
        msg: String,
    },

    /// The remote zone answered with a permanent error.
    #[error("remote error: {msg}")]
    Remote {
        /// Error message describing the issue.
        msg: String,
    },

    /// A record or remote entry does not exist.
    #[error("not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A record or log entry could not be decoded.
    #[error("decode error: {msg}")]
    Decode {
        /// Error message describing the issue.
        msg: String,
    },

    /// Local persistence failed.
    #[error("storage error: {msg}")]
    Storage {
        /// Error message describing the issue.
        msg: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// A persisted state or invariant is not what the engine expects.
    #[error("invalid sync state: {msg}")]
    InvalidState {
        /// Error message describing the issue.
        msg: String,
    },

    /// The engine is shutting down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl SyncError {
    /// Shorthand for [`SyncError::Again`].
    pub fn again(reason: impl Into<String>) -> Self {
        SyncError::Again {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SyncError::Storage`].
    pub fn storage(msg: impl Into<String>) -> Self {
        SyncError::Storage { msg: msg.into() }
    }

    /// Errors worth retrying in place: remote busy, optimistic write races, timeouts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Again { .. }
                | SyncError::Canceled { .. }
                | SyncError::Conflict { .. }
                | SyncError::Timeout { .. }
                | SyncError::Unavailable { .. }
        )
    }

    /// Errors meaning this process no longer owns the shard.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(self, SyncError::Busy { .. } | SyncError::LeaseLost { .. })
    }

    /// Errors a backoff supervisor absorbs by restarting its task.
    pub fn is_recoverable(&self) -> bool {
        self.is_transient() || self.is_ownership_loss()
    }

    /// Returns true for [`SyncError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Decode { msg: e.to_string() }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode { msg: e.to_string() }
    }
}
