//! Replication log and echo detection.
//!
//! Every replication attempt is upserted under its `sync_id`
//! (`table:record:hash`). A change whose hash was replicated in the opposite
//! direction moments ago is the echo of that replication and must not be
//! sent back.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::types::{Direction, LogStatus, SyncLogEntry};
use crate::error::DatabaseError;
use crate::storage::{format_timestamp, parse_timestamp, Database};

/// Sync log backed by `sync_log`.
#[derive(Debug, Clone)]
pub struct SyncLog {
    db: Database,
}

impl SyncLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert one outcome. An existing `sync_id` gets its status, error and
    /// timestamp refreshed.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    pub fn record(
        &self,
        table: &str,
        record_id: &str,
        direction: Direction,
        content_hash: &str,
        status: LogStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let sync_id = super::types::sync_id(table, record_id, content_hash);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_log
                    (sync_id, table_name, record_id, direction, content_hash, status, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(sync_id) DO UPDATE SET
                    direction = excluded.direction,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    created_at = excluded.created_at",
                params![
                    sync_id,
                    table,
                    record_id,
                    direction.as_str(),
                    content_hash,
                    status.as_str(),
                    error,
                    format_timestamp(Utc::now()),
                ],
            )
        })?;
        Ok(())
    }

    /// True if a completed replication of `content_hash` in the direction
    /// opposite to `direction` happened within `window`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn check_recent_opposite_direction(
        &self,
        content_hash: &str,
        direction: Direction,
        window: chrono::Duration,
    ) -> Result<bool, DatabaseError> {
        let since = format_timestamp(Utc::now() - window);
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_log
                 WHERE content_hash = ?1 AND direction = ?2 AND status = 'completed' AND created_at >= ?3",
                params![content_hash, direction.opposite().as_str(), since],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Look up one entry.
    ///
    /// # Errors
    /// Returns an error if the query fails or the row cannot be decoded.
    pub fn get(&self, sync_id: &str) -> Result<Option<SyncLogEntry>, DatabaseError> {
        let raw = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT sync_id, table_name, record_id, direction, content_hash, status, error_message, created_at
                 FROM sync_log WHERE sync_id = ?1",
                [sync_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((sync_id, table_name, record_id, direction, content_hash, status, error_message, created_at)) = raw
        else {
            return Ok(None);
        };
        let corrupt = |column: &str, message: String| DatabaseError::Corrupt {
            table: "sync_log".into(),
            column: column.into(),
            message,
        };
        Ok(Some(SyncLogEntry {
            direction: direction
                .parse()
                .map_err(|e: super::types::ParseEnumError| corrupt("direction", e.to_string()))?,
            status: status
                .parse()
                .map_err(|e: super::types::ParseEnumError| corrupt("status", e.to_string()))?,
            created_at: parse_timestamp(&created_at)
                .ok_or_else(|| corrupt("created_at", format!("bad timestamp '{created_at}'")))?,
            sync_id,
            table_name,
            record_id,
            content_hash,
            error_message,
        }))
    }

    /// Count entries by status, for status reporting.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn count(&self, status: LogStatus) -> Result<u64, DatabaseError> {
        let n: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_log WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Delete entries older than `retention`.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn cleanup(&self, retention: chrono::Duration) -> Result<usize, DatabaseError> {
        let cutoff = format_timestamp(Utc::now() - retention);
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM sync_log WHERE created_at < ?1", [cutoff]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::sync_id;

    fn log() -> (Database, SyncLog) {
        let db = Database::open_in_memory().unwrap();
        (db.clone(), SyncLog::new(db))
    }

    #[test]
    fn test_recent_opposite_direction_detects_echo() {
        let (_db, log) = log();
        log.record("users", "1", Direction::RelationalToRemote, "h1", LogStatus::Completed, None)
            .unwrap();

        let window = chrono::Duration::seconds(10);
        assert!(log
            .check_recent_opposite_direction("h1", Direction::RemoteToRelational, window)
            .unwrap());
        // same direction is not an echo
        assert!(!log
            .check_recent_opposite_direction("h1", Direction::RelationalToRemote, window)
            .unwrap());
        assert!(!log
            .check_recent_opposite_direction("h2", Direction::RemoteToRelational, window)
            .unwrap());
    }

    #[test]
    fn test_only_completed_entries_count() {
        let (_db, log) = log();
        log.record("users", "1", Direction::RelationalToRemote, "h1", LogStatus::Failed, Some("down"))
            .unwrap();
        log.record("users", "2", Direction::RelationalToRemote, "h2", LogStatus::Skipped, None)
            .unwrap();
        let window = chrono::Duration::seconds(10);
        assert!(!log
            .check_recent_opposite_direction("h1", Direction::RemoteToRelational, window)
            .unwrap());
        assert!(!log
            .check_recent_opposite_direction("h2", Direction::RemoteToRelational, window)
            .unwrap());
    }

    #[test]
    fn test_entries_outside_window_are_ignored() {
        let (db, log) = log();
        log.record("users", "1", Direction::RelationalToRemote, "h1", LogStatus::Completed, None)
            .unwrap();
        db.execute("UPDATE sync_log SET created_at = '2000-01-01T00:00:00.000Z'", &[])
            .unwrap();
        assert!(!log
            .check_recent_opposite_direction(
                "h1",
                Direction::RemoteToRelational,
                chrono::Duration::seconds(10)
            )
            .unwrap());
    }

    #[test]
    fn test_upsert_refreshes_existing_entry() {
        let (db, log) = log();
        log.record("users", "1", Direction::RemoteToRelational, "h1", LogStatus::Failed, Some("locked"))
            .unwrap();
        db.execute("UPDATE sync_log SET created_at = '2000-01-01T00:00:00.000Z'", &[])
            .unwrap();
        log.record("users", "1", Direction::RemoteToRelational, "h1", LogStatus::Completed, None)
            .unwrap();

        let entry = log.get(&sync_id("users", "1", "h1")).unwrap().unwrap();
        assert_eq!(entry.status, LogStatus::Completed);
        assert_eq!(entry.error_message, None);
        assert!(entry.created_at.timestamp() > 946_684_800);
        assert_eq!(log.count(LogStatus::Completed).unwrap(), 1);
        assert_eq!(log.count(LogStatus::Failed).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_drops_old_entries() {
        let (db, log) = log();
        log.record("users", "1", Direction::RemoteToRelational, "old", LogStatus::Completed, None)
            .unwrap();
        db.execute("UPDATE sync_log SET created_at = '2000-01-01T00:00:00.000Z'", &[])
            .unwrap();
        log.record("users", "1", Direction::RemoteToRelational, "new", LogStatus::Completed, None)
            .unwrap();

        assert_eq!(log.cleanup(chrono::Duration::days(30)).unwrap(), 1);
        assert!(log.get(&sync_id("users", "1", "old")).unwrap().is_none());
        assert!(log.get(&sync_id("users", "1", "new")).unwrap().is_some());
    }
}
