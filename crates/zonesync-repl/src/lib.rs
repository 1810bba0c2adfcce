#![warn(missing_docs)]

//! Zonesync replication engine: cross-zone metadata and bucket data sync
//! by tailing remote change logs under distributed leases.

pub mod applier;
pub mod backend;
pub mod backoff;
pub mod bucket_sync;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod error_log;
pub mod flow;
pub mod full_sync;
pub mod incremental;
pub mod lease;
pub mod marker;
pub mod meta_sync;
pub mod policy;
pub mod registry;
pub mod remote;
pub mod shard;
pub mod sink;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod types;

pub use backoff::{BackoffReset, BackoffSupervisor, Supervised, SyncBackoff};
pub use bucket_sync::{BucketPipeController, BucketPipePlan};
pub use config::{LogConfig, SyncConfig};
pub use controller::{SyncController, SyncPlan, ZoneSyncHandle};
pub use error::{Result, SyncError};
pub use lease::{LeaseBackend, LeaseManager, LeaseStatus, MemoryLeaseBackend};
pub use marker::{MarkerTracker, PersistAction};
pub use meta_sync::{MetadataPlan, ZoneSyncController};
pub use status::{ShardStatus, SyncInfo, ZoneSyncState};
pub use store::{LocalStore, MemoryStore, RecordStore, Versioned};
pub use types::{EntryOp, EntryStatus, LogEntry, ShardInfo, SyncMarker, SyncState};
