//! Core error types for bitable-sync-core.
//!
//! This module defines the error hierarchy using thiserror. Each layer
//! (relational store, remote store, configuration, replication) has its own
//! enum; [`CoreError`] wraps them for callers that do not care which layer
//! failed.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for bitable-sync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Relational store errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote store errors
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Replication errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Relational store errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: r2d2::Error,
    },

    /// No pooled connection became free in time
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A stored value could not be decoded
    #[error("Corrupt value in {table}.{column}: {message}")]
    Corrupt {
        table: String,
        column: String,
        message: String,
    },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Missing required configuration key
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Remote store errors.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The API answered with a non-zero code
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// The addressed record does not exist
    #[error("Record not found: {table}/{record_id}")]
    NotFound { table: String, record_id: String },

    /// Credentials rejected or missing
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Table address could not be parsed
    #[error("Invalid table address '{0}': expected '<app_token>:<table_id>'")]
    InvalidTable(String),

    /// Response did not have the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Store temporarily unreachable
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns true if repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Unavailable(_) => true,
            // Rate limiting and server-side failures come back as API codes.
            RemoteError::Api { .. } => true,
            RemoteError::NotFound { .. } => true,
            RemoteError::Authentication(_) => true,
            RemoteError::InvalidTable(_) | RemoteError::UnexpectedResponse(_) => false,
        }
    }
}

/// Errors raised while replicating a single change.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote store call failed
    #[error("Remote store: {0}")]
    Remote(#[from] RemoteError),

    /// Relational store call failed
    #[error("Database: {0}")]
    Database(#[from] DatabaseError),

    /// A value could not be translated between the two schemas
    #[error("Cannot translate field '{field}' of table '{table}': {message}")]
    Translation {
        table: String,
        field: String,
        message: String,
    },

    /// No table mapping is configured for the named table
    #[error("No table mapping configured for '{0}'")]
    MissingTableMapping(String),

    /// A change is missing the payload its action requires
    #[error("Change for {table}/{record_id} has no {payload} data")]
    MissingPayload {
        table: String,
        record_id: String,
        payload: &'static str,
    },

    /// Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Returns true if the change should be attempted again later.
    ///
    /// Translation and payload errors are deterministic and never retried;
    /// a missing table mapping is retried because configuration can be
    /// fixed while the item waits in the queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Database(e) => !matches!(e, DatabaseError::Corrupt { .. }),
            SyncError::MissingTableMapping(_) => true,
            SyncError::Translation { .. }
            | SyncError::MissingPayload { .. }
            | SyncError::Json(_) => false,
        }
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Database(err.into())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
