//! Bidirectional replication between the remote store and SQLite.
//!
//! Remote changes are found by diffing a per-table snapshot; relational
//! changes are captured by triggers into an outbound queue. Both directions
//! share the sync log (echo suppression), the identity map and the field
//! mapper.

pub mod capture;
pub mod change_detector;
pub mod conflict_resolver;
pub mod field_mapper;
pub mod hash;
pub mod identity_map;
pub mod outbound_queue;
pub mod service;
pub mod snapshot_store;
pub mod sync_log;
pub mod types;
pub mod worker;

#[cfg(test)]
mod outbound_queue_tests;
#[cfg(test)]
mod worker_tests;

pub use capture::{install_capture_triggers, remove_capture_triggers};
pub use change_detector::{detect_changes, Snapshot, SnapshotEntry};
pub use conflict_resolver::ConflictStrategy;
pub use field_mapper::FieldMapper;
pub use hash::ContentHasher;
pub use identity_map::IdentityMap;
pub use outbound_queue::OutboundQueue;
pub use service::{CleanupReport, CounterSnapshot, CycleReport, ServiceStatus, SyncService};
pub use snapshot_store::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use sync_log::SyncLog;
pub use types::{
    ChangeAction, ChangeEvent, ChangeSource, Direction, LogStatus, OutboundQueueItem, QueueStats,
    QueueStatus, SyncLogEntry,
};
pub use worker::{ApplyOutcome, SyncWorker};
