//! Persistence for remote table snapshots.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;

use super::change_detector::Snapshot;
use crate::error::DatabaseError;
use crate::storage::{format_timestamp, Database};

/// Where snapshots live between detection passes.
pub trait SnapshotStore: Send + Sync {
    /// Snapshot for `table`; empty if none was saved.
    fn load(&self, table: &str) -> Result<Snapshot, DatabaseError>;

    /// Replace the snapshot for `table`.
    fn save(&self, table: &str, snapshot: &Snapshot) -> Result<(), DatabaseError>;

    /// Forget `table`, so the next pass treats every record as new.
    fn reset(&self, table: &str) -> Result<(), DatabaseError>;
}

/// Snapshots stored as one JSON document per table in `sync_snapshot`.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    db: Database,
}

impl SqliteSnapshotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, table: &str) -> Result<Snapshot, DatabaseError> {
        let row = self.db.query_one(
            "SELECT data FROM sync_snapshot WHERE table_name = ?1",
            &[json!(table)],
        )?;
        let Some(raw) = row.as_ref().and_then(|r| r.get("data")).and_then(|v| v.as_str()) else {
            return Ok(Snapshot::new());
        };
        serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt {
            table: "sync_snapshot".into(),
            column: format!("data[{table}]"),
            message: e.to_string(),
        })
    }

    fn save(&self, table: &str, snapshot: &Snapshot) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(snapshot)
            .map_err(|e| DatabaseError::QueryFailed(format!("serialize snapshot: {e}")))?;
        self.db.execute(
            "INSERT INTO sync_snapshot (table_name, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            &[json!(table), json!(data), json!(format_timestamp(Utc::now()))],
        )?;
        Ok(())
    }

    fn reset(&self, table: &str) -> Result<(), DatabaseError> {
        self.db.execute(
            "DELETE FROM sync_snapshot WHERE table_name = ?1",
            &[json!(table)],
        )?;
        Ok(())
    }
}

/// Snapshots held in process memory; lost on restart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, table: &str) -> Result<Snapshot, DatabaseError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.get(table).cloned().unwrap_or_default())
    }

    fn save(&self, table: &str, snapshot: &Snapshot) -> Result<(), DatabaseError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), snapshot.clone());
        Ok(())
    }

    fn reset(&self, table: &str) -> Result<(), DatabaseError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
        Ok(())
    }
}
