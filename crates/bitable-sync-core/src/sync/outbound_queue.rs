//! Durable queue of relational-side changes awaiting replication.
//!
//! Items are stored in the `sync_queue` table. Producers (capture triggers
//! or [`OutboundQueue::enqueue`]) append; the worker drains in FIFO order and
//! reports each outcome. An item that fails `max_retries` times is parked as
//! permanently failed.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{ChangeAction, OutboundQueueItem, QueueStats, QueueStatus};
use crate::error::DatabaseError;
use crate::remote::Fields;
use crate::storage::{format_timestamp, parse_timestamp, Database};

/// Default retry ceiling.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const SELECT_COLUMNS: &str = "id, table_name, record_id, action, old_data, new_data, content_hash, \
     status, retry_count, error_message, created_at, processed_at";

/// Row as stored, before decoding.
struct RawItem {
    id: i64,
    table_name: String,
    record_id: String,
    action: String,
    old_data: Option<String>,
    new_data: Option<String>,
    content_hash: Option<String>,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
    created_at: String,
    processed_at: Option<String>,
}

impl RawItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table_name: row.get(1)?,
            record_id: row.get(2)?,
            action: row.get(3)?,
            old_data: row.get(4)?,
            new_data: row.get(5)?,
            content_hash: row.get(6)?,
            status: row.get(7)?,
            retry_count: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            processed_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<OutboundQueueItem, DatabaseError> {
        let corrupt = |column: &str, message: String| DatabaseError::Corrupt {
            table: "sync_queue".into(),
            column: column.into(),
            message: format!("item {}: {message}", self.id),
        };
        let json = |column: &str, raw: &Option<String>| -> Result<Option<Fields>, DatabaseError> {
            raw.as_deref()
                .map(|text| serde_json::from_str::<Fields>(text))
                .transpose()
                .map_err(|e| corrupt(column, e.to_string()))
        };
        let timestamp = |column: &str, raw: &str| -> Result<DateTime<Utc>, DatabaseError> {
            parse_timestamp(raw).ok_or_else(|| corrupt(column, format!("bad timestamp '{raw}'")))
        };

        let action = self
            .action
            .parse::<ChangeAction>()
            .map_err(|e| corrupt("action", e.to_string()))?;
        let status = self
            .status
            .parse::<QueueStatus>()
            .map_err(|e| corrupt("status", e.to_string()))?;
        let old_data = json("old_data", &self.old_data)?;
        let new_data = json("new_data", &self.new_data)?;
        let created_at = timestamp("created_at", &self.created_at)?;
        let processed_at = self
            .processed_at
            .as_deref()
            .map(|raw| timestamp("processed_at", raw))
            .transpose()?;

        Ok(OutboundQueueItem {
            id: self.id,
            table_name: self.table_name,
            record_id: self.record_id,
            action,
            old_data,
            new_data,
            content_hash: self.content_hash.filter(|h| !h.is_empty()),
            status,
            retry_count: u32::try_from(self.retry_count.max(0)).unwrap_or(u32::MAX),
            error_message: self.error_message,
            created_at,
            processed_at,
        })
    }
}

/// Outbound queue backed by `sync_queue`.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    db: Database,
    max_retries: u32,
}

impl OutboundQueue {
    pub fn new(db: Database, max_retries: u32) -> Self {
        Self {
            db,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn select(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<OutboundQueueItem>, DatabaseError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_queue {clause}");
        let raw = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params, RawItem::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raw.into_iter().map(RawItem::decode).collect()
    }

    /// Append a change. Returns the item id.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        action: ChangeAction,
        old_data: Option<&Fields>,
        new_data: Option<&Fields>,
        content_hash: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let to_text = |data: Option<&Fields>| data.map(|d| serde_json::Value::Object(d.clone()).to_string());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_queue
                    (table_name, record_id, action, old_data, new_data, content_hash, status, retry_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)",
                params![
                    table,
                    record_id,
                    action.as_str(),
                    to_text(old_data),
                    to_text(new_data),
                    content_hash,
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Oldest pending items below the retry ceiling, FIFO. Does not mark them.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn dequeue_pending(&self, limit: usize) -> Result<Vec<OutboundQueueItem>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.select(
            "WHERE status = 'pending' AND retry_count < ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
            &[&self.max_retries, &limit],
        )
    }

    /// One item by id.
    ///
    /// # Errors
    /// Returns an error if the query fails or the row cannot be decoded.
    pub fn get(&self, id: i64) -> Result<Option<OutboundQueueItem>, DatabaseError> {
        Ok(self.select("WHERE id = ?1", &[&id])?.into_iter().next())
    }

    /// Every pending item for one record, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn pending_for_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Vec<OutboundQueueItem>, DatabaseError> {
        self.select(
            "WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending'
             ORDER BY created_at DESC, id DESC",
            &[&table, &record_id],
        )
    }

    /// Items with the given status (all if `None`), newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<OutboundQueueItem>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => self.select(
                "WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                &[&status.as_str(), &limit],
            ),
            None => self.select("ORDER BY created_at DESC, id DESC LIMIT ?1", &[&limit]),
        }
    }

    fn set_status(&self, id: i64, status: QueueStatus, error: Option<&str>) -> Result<(), DatabaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET status = ?2, error_message = COALESCE(?3, error_message), processed_at = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), error, format_timestamp(Utc::now())],
            )
        })?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub fn mark_processing(&self, id: i64) -> Result<(), DatabaseError> {
        self.set_status(id, QueueStatus::Processing, None)
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub fn mark_completed(&self, id: i64) -> Result<(), DatabaseError> {
        self.set_status(id, QueueStatus::Completed, None)
    }

    /// Count a failed attempt. The item goes back to pending, or to failed
    /// once the retry ceiling is reached. Returns the new status.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<QueueStatus, DatabaseError> {
        let status: Option<String> = self.db.with_transaction(|conn| {
            conn.execute(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1,
                     error_message = ?2,
                     processed_at = ?3,
                     status = CASE WHEN retry_count + 1 >= ?4 THEN 'failed' ELSE 'pending' END
                 WHERE id = ?1",
                params![id, error, format_timestamp(Utc::now()), self.max_retries],
            )?;
            conn.query_row("SELECT status FROM sync_queue WHERE id = ?1", [id], |row| row.get(0))
                .optional()
        })?;
        match status {
            Some(text) => text.parse().map_err(|e: super::types::ParseEnumError| {
                DatabaseError::Corrupt {
                    table: "sync_queue".into(),
                    column: "status".into(),
                    message: e.to_string(),
                }
            }),
            None => Err(DatabaseError::QueryFailed(format!("queue item {id} not found"))),
        }
    }

    /// Park an item as failed without further retries.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub fn abandon(&self, id: i64, error: &str) -> Result<(), DatabaseError> {
        self.set_status(id, QueueStatus::Failed, Some(error))
    }

    /// Put items left in processing by an interrupted run back to pending.
    /// Returns how many were recovered.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub fn recover_processing(&self) -> Result<usize, DatabaseError> {
        self.db
            .with_conn(|conn| conn.execute("UPDATE sync_queue SET status = 'pending' WHERE status = 'processing'", []))
    }

    /// Counts by status plus the oldest pending timestamp.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let (counts, oldest) = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let oldest: Option<String> = conn.query_row(
                "SELECT MIN(created_at) FROM sync_queue WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok((counts, oldest))
        })?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => stats.pending = count,
                Ok(QueueStatus::Processing) => stats.processing = count,
                Ok(QueueStatus::Completed) => stats.completed = count,
                Ok(QueueStatus::Failed) => stats.failed = count,
                Err(e) => tracing::warn!(error = %e, "ignoring queue rows with unknown status"),
            }
            stats.total += count;
        }
        stats.oldest_pending = oldest.as_deref().and_then(parse_timestamp);
        Ok(stats)
    }

    /// Delete completed items processed more than `retention` ago.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn cleanup(&self, retention: chrono::Duration) -> Result<usize, DatabaseError> {
        let cutoff = format_timestamp(Utc::now() - retention);
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sync_queue
                 WHERE status = 'completed' AND COALESCE(processed_at, created_at) < ?1",
                [cutoff],
            )
        })
    }
}
