//! TOML-based service configuration.
//!
//! Stores:
//! - Remote store credentials and endpoint
//! - Relational store location and pool sizing
//! - Polling intervals, retry ceiling, retention windows
//! - Per-table mappings between the two schemas
//!
//! Configuration is stored at `~/.config/bitable-sync/config.toml` unless a
//! path is given explicitly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;
use crate::sync::conflict_resolver::ConflictStrategy;

/// Environment variable consulted when `remote.app_secret` is not set.
pub const APP_SECRET_ENV: &str = "BITABLE_SYNC_APP_SECRET";

/// Remote (Bitable) store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub app_id: String,
    /// Optional; falls back to the `BITABLE_SYNC_APP_SECRET` environment variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Relational (SQLite) store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `bitable-sync.db` in the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// How list values are stored in a single relational column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiValueEncoding {
    /// Join with the table's delimiter. Elements containing the delimiter
    /// are rejected instead of being split apart on the way back.
    #[default]
    Delimited,
    /// Store the list as JSON text.
    Json,
}

/// Mapping between one remote table and one relational table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    /// Remote table address, `<app_token>:<table_id>`.
    pub remote_table: String,
    /// Relational table name. Also the logical table name used by the
    /// identity map, the queue and the sync log.
    pub relational_table: String,
    /// Primary key column of the relational table.
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Relational column holding the remote record id.
    #[serde(default = "default_remote_id_column")]
    pub remote_id_column: String,
    /// Remote field holding the relational row id.
    #[serde(default = "default_cross_reference_field")]
    pub cross_reference_field: String,
    /// Remote field name -> relational column name. Unlisted names pass through.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Relational columns that hold encoded lists.
    #[serde(default)]
    pub multi_value_columns: Vec<String>,
    #[serde(default)]
    pub multi_value_encoding: MultiValueEncoding,
    #[serde(default = "default_delimiter")]
    pub multi_value_delimiter: String,
    /// Install change-capture triggers on the relational table at startup.
    #[serde(default = "default_true")]
    pub capture: bool,
}

/// Replication behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_remote_poll_interval")]
    pub remote_poll_interval_secs: u64,
    #[serde(default = "default_relational_poll_interval")]
    pub relational_poll_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Window in which a replication counts as the origin of an echo.
    #[serde(default = "default_loop_window")]
    pub loop_window_secs: u64,
    #[serde(default = "default_queue_retention_days")]
    pub queue_retention_days: u64,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub tables: Vec<TableMapping>,
}

/// Log output configuration. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Service configuration.
///
/// Serialized to/from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_base_url() -> String {
    "https://open.feishu.cn/open-apis".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_pool_size() -> usize {
    4
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_key_column() -> String {
    "id".into()
}
fn default_remote_id_column() -> String {
    "feishu_id".into()
}
fn default_cross_reference_field() -> String {
    "db_id".into()
}
fn default_delimiter() -> String {
    ",".into()
}
fn default_true() -> bool {
    true
}
fn default_remote_poll_interval() -> u64 {
    5
}
fn default_relational_poll_interval() -> u64 {
    10
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_loop_window() -> u64 {
    10
}
fn default_queue_retention_days() -> u64 {
    7
}
fn default_log_retention_days() -> u64 {
    30
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_id: String::new(),
            app_secret: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_poll_interval_secs: default_remote_poll_interval(),
            relational_poll_interval_secs: default_relational_poll_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            loop_window_secs: default_loop_window(),
            queue_retention_days: default_queue_retention_days(),
            log_retention_days: default_log_retention_days(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            conflict_strategy: ConflictStrategy::default(),
            tables: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TableMapping {
    /// Mapping with default bookkeeping column names and no renames.
    pub fn new(remote_table: impl Into<String>, relational_table: impl Into<String>) -> Self {
        Self {
            remote_table: remote_table.into(),
            relational_table: relational_table.into(),
            key_column: default_key_column(),
            remote_id_column: default_remote_id_column(),
            cross_reference_field: default_cross_reference_field(),
            fields: BTreeMap::new(),
            multi_value_columns: Vec::new(),
            multi_value_encoding: MultiValueEncoding::default(),
            multi_value_delimiter: default_delimiter(),
            capture: true,
        }
    }

    /// Add a remote field -> relational column rename.
    pub fn with_field(mut self, remote: impl Into<String>, relational: impl Into<String>) -> Self {
        self.fields.insert(remote.into(), relational.into());
        self
    }

    /// Declare a relational column as holding an encoded list.
    pub fn with_multi_value_column(mut self, column: impl Into<String>) -> Self {
        self.multi_value_columns.push(column.into());
        self
    }

    /// Set the list encoding.
    pub fn with_multi_value_encoding(mut self, encoding: MultiValueEncoding) -> Self {
        self.multi_value_encoding = encoding;
        self
    }
}

impl SyncConfig {
    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_secs(self.remote_poll_interval_secs)
    }

    pub fn relational_poll_interval(&self) -> Duration {
        Duration::from_secs(self.relational_poll_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn loop_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.loop_window_secs as i64)
    }

    pub fn queue_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.queue_retention_days as i64)
    }

    pub fn log_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.log_retention_days as i64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Find the mapping for a logical (relational) table name.
    pub fn table(&self, relational_table: &str) -> Option<&TableMapping> {
        self.tables
            .iter()
            .find(|t| t.relational_table == relational_table)
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = match current {
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    /// Default config file location.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("~/.config/bitable-sync"),
                message: e.to_string(),
            })
    }

    /// Load from the default location, writing defaults if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        match std::fs::read_to_string(&path) {
            Ok(_) => Self::load_from(&path),
            Err(_) => {
                let cfg = Self::default();
                cfg.save_to(&path)?;
                Ok(cfg)
            }
        }
    }

    /// Load from an explicit path. The file must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Persist to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_err = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_err(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_err(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    ///
    /// Array elements are addressed by index, e.g. `sync.tables.0.remote_table`.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Resolved app secret: config value first, then the environment.
    pub fn app_secret(&self) -> Option<String> {
        self.remote
            .app_secret
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var(APP_SECRET_ENV).ok().filter(|s| !s.is_empty()))
    }

    /// Resolved database file path.
    ///
    /// # Errors
    /// Returns an error if no path is configured and the data directory
    /// cannot be created.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::default_path()?.with_file_name("bitable-sync.db")),
        }
    }

    /// Check that the configuration can drive a sync service.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.app_id.is_empty() {
            return Err(ConfigError::MissingKey("remote.app_id".into()));
        }
        if self.app_secret().is_none() {
            return Err(ConfigError::MissingKey(format!(
                "remote.app_secret (or {APP_SECRET_ENV})"
            )));
        }
        if self.sync.tables.is_empty() {
            return Err(ConfigError::MissingKey("sync.tables".into()));
        }
        if self.sync.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sync.max_retries".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sync.batch_size".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.sync.log_retention_days < self.sync.queue_retention_days {
            return Err(ConfigError::InvalidValue {
                key: "sync.log_retention_days".into(),
                message: "must not be shorter than sync.queue_retention_days".into(),
            });
        }

        let mut remote_seen = HashSet::new();
        let mut relational_seen = HashSet::new();
        for (i, table) in self.sync.tables.iter().enumerate() {
            if !table.remote_table.contains(':') {
                return Err(ConfigError::InvalidValue {
                    key: format!("sync.tables.{i}.remote_table"),
                    message: format!(
                        "'{}' is not of the form <app_token>:<table_id>",
                        table.remote_table
                    ),
                });
            }
            if !remote_seen.insert(table.remote_table.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("sync.tables.{i}.remote_table"),
                    message: format!("'{}' is mapped more than once", table.remote_table),
                });
            }
            if !relational_seen.insert(table.relational_table.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("sync.tables.{i}.relational_table"),
                    message: format!("'{}' is mapped more than once", table.relational_table),
                });
            }
            if table.multi_value_encoding == MultiValueEncoding::Delimited
                && table.multi_value_delimiter.is_empty()
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("sync.tables.{i}.multi_value_delimiter"),
                    message: "must not be empty".into(),
                });
            }
        }
        Ok(())
    }

    /// Example configuration written by `config init`.
    pub fn example() -> Self {
        let mut cfg = Self::default();
        cfg.remote.app_id = "cli_xxxxxxxxxxxx".into();
        cfg.sync.tables.push(
            TableMapping::new("bascnXXXXXXXX:tblXXXXXXXX", "users")
                .with_field("姓名", "name")
                .with_field("年龄", "age")
                .with_field("邮箱", "email"),
        );
        cfg
    }
}
