mod config;
pub mod database;
pub mod migrations;

pub use config::{
    Config, DatabaseConfig, LoggingConfig, MultiValueEncoding, RemoteConfig, SyncConfig,
    TableMapping,
};
pub use database::{Database, Row};

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;

/// Returns `~/.config/bitable-sync[-dev]/` based on BITABLE_SYNC_ENV.
///
/// Set BITABLE_SYNC_ENV=dev to use the development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("BITABLE_SYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("bitable-sync-dev")
    } else {
        base_dir.join("bitable-sync")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Format a timestamp the way every engine table stores it.
///
/// Millisecond precision with a `Z` suffix keeps lexical and chronological
/// order identical, which the range queries rely on. SQLite triggers write
/// the same shape with `strftime('%Y-%m-%dT%H:%M:%fZ', 'now')`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Returns `None` for anything unparseable.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
