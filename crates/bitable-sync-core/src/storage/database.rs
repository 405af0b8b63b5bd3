//! Relational store adapter over SQLite.
//!
//! Provides:
//! - An r2d2 connection pool (WAL, busy timeout) shared across threads
//! - Parameterized SQL with JSON-valued parameters and rows
//! - Row helpers: insert, update, delete and upsert by key column
//!
//! The engine tables are migrated once when the pool is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};

use super::migrations;
use crate::error::DatabaseError;

/// A row keyed by column name.
pub type Row = Map<String, Value>;

type SqlitePool = Pool<SqliteConnectionManager>;

/// SQLite database handle. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("pool_size", &self.pool.max_size())
            .finish()
    }
}

impl Database {
    /// Open (or create) the database file at `path` with up to `pool_size`
    /// connections.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(
        path: &Path,
        pool_size: usize,
        busy_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::QueryFailed(format!(
                        "cannot create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.pragma_update(None, "synchronous", "NORMAL")
            });
        let pool = Pool::builder()
            .max_size(u32::try_from(pool_size.max(1)).unwrap_or(u32::MAX))
            .build(manager)
            .map_err(|source| DatabaseError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        migrations::migrate(&*pool.get()?)?;

        tracing::debug!(path = %path.display(), pool_size = pool.max_size(), "database opened");
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database.
    ///
    /// Every in-memory connection is its own database, so the pool holds
    /// exactly one connection that is never recycled.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())
            .map_err(|source| DatabaseError::OpenFailed {
                path: PathBuf::from(":memory:"),
                source,
            })?;
        migrations::migrate(&*pool.get()?)?;
        Ok(Self { pool, path: None })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, DatabaseError> {
        Ok(self.pool.get()?)
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with a pooled connection.
    ///
    /// # Errors
    /// Propagates the closure's SQLite error.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DatabaseError> {
        let conn = self.conn()?;
        f(&conn).map_err(DatabaseError::from)
    }

    /// Run `f` inside a transaction; commits when `f` returns `Ok`.
    ///
    /// # Errors
    /// Propagates the closure's error; the transaction is rolled back.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DatabaseError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Check that a connection answers.
    ///
    /// # Errors
    /// Returns an error if the trivial query fails.
    pub fn ping(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .map(|_| ())
    }

    /// Run a query and return every row.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        self.with_conn(|conn| query_rows(conn, sql, params))
    }

    /// Run a query and return the first row, if any.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    pub fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, DatabaseError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Execute a statement and return the number of affected rows.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, DatabaseError> {
        self.with_conn(|conn| conn.execute(sql, params_from_iter(params.iter().map(to_sql))))
    }

    /// Insert a row and return its rowid.
    ///
    /// # Errors
    /// Returns an error if the row is empty or the insert fails.
    pub fn insert(&self, table: &str, row: &Row) -> Result<i64, DatabaseError> {
        if row.is_empty() {
            return Err(DatabaseError::QueryFailed(format!(
                "refusing to insert an empty row into {table}"
            )));
        }
        let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<Value> = row.values().cloned().collect();
        self.with_conn(|conn| {
            conn.execute(&sql, params_from_iter(values.iter().map(to_sql)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Update the row whose `key_column` equals `key`. Returns rows affected.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        row: &Row,
    ) -> Result<usize, DatabaseError> {
        let assignments: Vec<(&String, &Value)> =
            row.iter().filter(|(k, _)| k.as_str() != key_column).collect();
        if assignments.is_empty() {
            return Ok(0);
        }
        let set_clause: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, (k, _))| format!("{} = ?{}", quote_ident(k), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(table),
            set_clause.join(", "),
            quote_ident(key_column),
            assignments.len() + 1
        );
        let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v.clone()).collect();
        values.push(key.clone());
        self.execute(&sql, &values)
    }

    /// Delete the row whose `key_column` equals `key`. Returns rows affected.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn delete(&self, table: &str, key_column: &str, key: &Value) -> Result<usize, DatabaseError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(table),
            quote_ident(key_column)
        );
        self.execute(&sql, std::slice::from_ref(key))
    }

    /// Insert the row, or update every other column when `conflict_column`
    /// already holds its value.
    ///
    /// `conflict_column` must carry a unique index.
    ///
    /// # Errors
    /// Returns an error if the row lacks `conflict_column` or the statement fails.
    pub fn upsert(&self, table: &str, conflict_column: &str, row: &Row) -> Result<usize, DatabaseError> {
        if !row.contains_key(conflict_column) {
            return Err(DatabaseError::QueryFailed(format!(
                "upsert into {table} needs a value for {conflict_column}"
            )));
        }
        let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = row
            .keys()
            .filter(|k| k.as_str() != conflict_column)
            .map(|k| format!("{0} = excluded.{0}", quote_ident(k)))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", "),
            quote_ident(conflict_column),
            on_conflict
        );
        let values: Vec<Value> = row.values().cloned().collect();
        self.execute(&sql, &values)
    }

    /// Returns true if a table (or view) of that name exists.
    ///
    /// # Errors
    /// Returns an error if the catalog query fails.
    pub fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                [table],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n > 0)
    }

    /// Column names of `table`, in declaration order.
    ///
    /// # Errors
    /// Returns an error if the pragma query fails.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
            let names = stmt
                .query_map([table], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fields = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            fields.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(fields);
    }
    Ok(out)
}

/// JSON parameter to SQLite value. Nested structures are stored as JSON text.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// SQLite column value to JSON. Blobs become lowercase hex.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}
