//! Schema migrations for the engine's own tables.
//!
//! Migrations are versioned and applied automatically when a database is
//! opened. The `schema_version` table tracks the current version. User
//! tables are never touched here.

use rusqlite::Connection;

use crate::error::DatabaseError;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// SQLite expression producing the same text as [`super::format_timestamp`].
pub const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Apply all pending migrations.
///
/// # Errors
/// Returns an error if a migration fails; the failing step is rolled back.
pub fn migrate(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")
        .map_err(|e| DatabaseError::MigrationFailed(format!("schema_version: {e}")))?;

    let current = schema_version(conn)?;
    if current < 1 {
        apply(conn, 1, migrate_v1)?;
    }
    if current < 2 {
        apply(conn, 2, migrate_v2)?;
    }
    Ok(())
}

/// Current schema version; 0 for a fresh database.
///
/// # Errors
/// Returns an error if the version table cannot be read.
pub fn schema_version(conn: &Connection) -> Result<i32, DatabaseError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .map_err(|e| DatabaseError::MigrationFailed(format!("read schema_version: {e}")))
}

fn apply(
    conn: &Connection,
    version: i32,
    step: fn(&Connection) -> rusqlite::Result<()>,
) -> Result<(), DatabaseError> {
    let run = || -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        step(&tx)?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()
    };
    run().map_err(|e| DatabaseError::MigrationFailed(format!("v{version}: {e}")))?;
    tracing::debug!(version, "applied schema migration");
    Ok(())
}

/// Migration v1: outbound queue, sync log and identity map.
fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS sync_queue (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name    TEXT NOT NULL,
            record_id     TEXT NOT NULL,
            action        TEXT NOT NULL,
            old_data      TEXT,
            new_data      TEXT,
            content_hash  TEXT,
            status        TEXT NOT NULL DEFAULT 'pending',
            retry_count   INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at    TEXT NOT NULL DEFAULT ({now}),
            processed_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created
            ON sync_queue(status, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_record
            ON sync_queue(table_name, record_id);

        CREATE TABLE IF NOT EXISTS sync_log (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_id       TEXT NOT NULL UNIQUE,
            table_name    TEXT NOT NULL,
            record_id     TEXT NOT NULL,
            direction     TEXT NOT NULL,
            content_hash  TEXT NOT NULL,
            status        TEXT NOT NULL,
            error_message TEXT,
            created_at    TEXT NOT NULL DEFAULT ({now})
        );
        CREATE INDEX IF NOT EXISTS idx_sync_log_hash_created
            ON sync_log(content_hash, created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_log_created
            ON sync_log(created_at);

        CREATE TABLE IF NOT EXISTS id_mapping (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name    TEXT NOT NULL,
            relational_id TEXT NOT NULL,
            remote_id     TEXT NOT NULL,
            created_at    TEXT NOT NULL DEFAULT ({now}),
            updated_at    TEXT NOT NULL DEFAULT ({now}),
            UNIQUE (table_name, relational_id),
            UNIQUE (table_name, remote_id)
        );",
        now = SQL_NOW
    ))
}

/// Migration v2: persisted remote snapshots, one JSON document per table.
fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS sync_snapshot (
            table_name TEXT PRIMARY KEY,
            data       TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ({now})
        );",
        now = SQL_NOW
    ))
}
