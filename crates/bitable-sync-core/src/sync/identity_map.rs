//! Persistent mapping between relational row ids and remote record ids.

use rusqlite::{params, OptionalExtension};

use chrono::Utc;

use crate::error::DatabaseError;
use crate::storage::{format_timestamp, Database};

/// Identity map backed by `id_mapping`.
#[derive(Debug, Clone)]
pub struct IdentityMap {
    db: Database,
}

impl IdentityMap {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Map `relational_id` to `remote_id` in `table`, replacing any previous
    /// mapping of either id.
    ///
    /// # Errors
    /// Returns an error if the statements fail.
    pub fn save(&self, table: &str, relational_id: &str, remote_id: &str) -> Result<(), DatabaseError> {
        let now = format_timestamp(Utc::now());
        self.db.with_transaction(|conn| {
            conn.execute(
                "DELETE FROM id_mapping WHERE table_name = ?1 AND remote_id = ?2 AND relational_id <> ?3",
                params![table, remote_id, relational_id],
            )?;
            conn.execute(
                "INSERT INTO id_mapping (table_name, relational_id, remote_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(table_name, relational_id) DO UPDATE SET
                    remote_id = excluded.remote_id,
                    updated_at = excluded.updated_at",
                params![table, relational_id, remote_id, now],
            )
        })?;
        tracing::debug!(table, relational_id, remote_id, "saved identity mapping");
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get_remote_id(&self, table: &str, relational_id: &str) -> Result<Option<String>, DatabaseError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT remote_id FROM id_mapping WHERE table_name = ?1 AND relational_id = ?2",
                [table, relational_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get_relational_id(&self, table: &str, remote_id: &str) -> Result<Option<String>, DatabaseError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT relational_id FROM id_mapping WHERE table_name = ?1 AND remote_id = ?2",
                [table, remote_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Drop the mapping of a relational id. Returns true if one existed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn remove_by_relational_id(&self, table: &str, relational_id: &str) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM id_mapping WHERE table_name = ?1 AND relational_id = ?2",
                    [table, relational_id],
                )
            })
            .map(|n| n > 0)
    }

    /// Drop the mapping of a remote id. Returns true if one existed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn remove_by_remote_id(&self, table: &str, remote_id: &str) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM id_mapping WHERE table_name = ?1 AND remote_id = ?2",
                    [table, remote_id],
                )
            })
            .map(|n| n > 0)
    }

    /// Number of mappings in `table`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn count(&self, table: &str) -> Result<u64, DatabaseError> {
        let n: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM id_mapping WHERE table_name = ?1",
                [table],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> IdentityMap {
        IdentityMap::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_save_and_lookup_both_ways() {
        let ids = map();
        ids.save("users", "1", "rec1").unwrap();
        assert_eq!(ids.get_remote_id("users", "1").unwrap().as_deref(), Some("rec1"));
        assert_eq!(ids.get_relational_id("users", "rec1").unwrap().as_deref(), Some("1"));
        assert_eq!(ids.get_remote_id("orders", "1").unwrap(), None);
    }

    #[test]
    fn test_save_replaces_existing_mapping() {
        let ids = map();
        ids.save("users", "1", "rec1").unwrap();
        ids.save("users", "1", "rec2").unwrap();
        assert_eq!(ids.get_remote_id("users", "1").unwrap().as_deref(), Some("rec2"));
        assert_eq!(ids.get_relational_id("users", "rec1").unwrap(), None);
        assert_eq!(ids.count("users").unwrap(), 1);
    }

    #[test]
    fn test_save_clears_stale_remote_owner() {
        let ids = map();
        ids.save("users", "1", "rec1").unwrap();
        ids.save("users", "2", "rec1").unwrap();
        assert_eq!(ids.get_relational_id("users", "rec1").unwrap().as_deref(), Some("2"));
        assert_eq!(ids.get_remote_id("users", "1").unwrap(), None);
    }

    #[test]
    fn test_tables_are_independent() {
        let ids = map();
        ids.save("users", "1", "rec1").unwrap();
        ids.save("orders", "1", "rec1").unwrap();
        assert_eq!(ids.count("users").unwrap(), 1);
        assert_eq!(ids.count("orders").unwrap(), 1);
    }

    #[test]
    fn test_remove() {
        let ids = map();
        ids.save("users", "1", "rec1").unwrap();
        ids.save("users", "2", "rec2").unwrap();

        assert!(ids.remove_by_relational_id("users", "1").unwrap());
        assert!(!ids.remove_by_relational_id("users", "1").unwrap());
        assert!(ids.remove_by_remote_id("users", "rec2").unwrap());
        assert_eq!(ids.count("users").unwrap(), 0);
    }
}
