//! Core types for bidirectional replication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::remote::Fields;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// Which store a change originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Remote,
    Relational,
}

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    RemoteToRelational,
    RelationalToRemote,
}

/// Lifecycle of an outbound queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Outcome recorded in the sync log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Completed,
    Failed,
    Skipped,
}

/// Error for unknown enum text read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Storage text.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(ChangeAction, "change action", {
    Insert => "insert",
    Update => "update",
    Delete => "delete",
});

text_enum!(ChangeSource, "change source", {
    Remote => "remote",
    Relational => "relational",
});

text_enum!(Direction, "direction", {
    RemoteToRelational => "remote_to_relational",
    RelationalToRemote => "relational_to_remote",
});

text_enum!(QueueStatus, "queue status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(LogStatus, "log status", {
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::RemoteToRelational => Direction::RelationalToRemote,
            Direction::RelationalToRemote => Direction::RemoteToRelational,
        }
    }
}

impl ChangeSource {
    /// Direction in which a change from this source is replicated.
    pub fn direction(&self) -> Direction {
        match self {
            ChangeSource::Remote => Direction::RemoteToRelational,
            ChangeSource::Relational => Direction::RelationalToRemote,
        }
    }
}

/// A detected change to one record.
///
/// `table` is always the logical (relational) table name. `record_id` is
/// the id native to the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub record_id: String,
    pub table: String,
    pub action: ChangeAction,
    pub old_data: Option<Fields>,
    pub new_data: Option<Fields>,
    pub content_hash: String,
    pub detected_at: DateTime<Utc>,
    pub source: ChangeSource,
}

impl ChangeEvent {
    /// `table:record:hash`, the sync log key for this change.
    pub fn sync_id(&self) -> String {
        sync_id(&self.table, &self.record_id, &self.content_hash)
    }
}

/// Build a sync log key.
pub fn sync_id(table: &str, record_id: &str, content_hash: &str) -> String {
    format!("{table}:{record_id}:{content_hash}")
}

/// A relational-side change waiting to be replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundQueueItem {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub action: ChangeAction,
    pub old_data: Option<Fields>,
    pub new_data: Option<Fields>,
    /// `None` when the producer left hashing to the worker.
    pub content_hash: Option<String>,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One replication outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub sync_id: String,
    pub table_name: String,
    pub record_id: String,
    pub direction: Direction,
    pub content_hash: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outbound queue counts by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Seconds the oldest pending item has been waiting.
    pub fn oldest_pending_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.oldest_pending.map(|t| (now - t).num_seconds().max(0))
    }
}
