//! Subcommand implementations and the setup they share.

pub mod config;
pub mod once;
pub mod queue;
pub mod run;
pub mod snapshot;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bitable_sync_core::{Config, Database, HttpRemoteStore, SyncService};
use tracing_subscriber::EnvFilter;

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Config file in use: `--config` or the default location.
pub fn config_path(explicit: Option<&Path>) -> CliResult<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(Config::default_path()?),
    }
}

/// Load the config and install the log subscriber at its level.
///
/// An explicit path must exist; the default location is created with
/// defaults on first use.
pub fn load_config(explicit: Option<&Path>) -> CliResult<Config> {
    let config = match explicit {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_logging(&config.logging.level);
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A second call in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn open_database(config: &Config) -> CliResult<Database> {
    let path = config.database_path()?;
    Ok(Database::open(
        &path,
        config.database.pool_size,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?)
}

/// Service wired to the configured database and the Bitable HTTP API.
pub fn build_service(config: &Config) -> CliResult<SyncService> {
    config.validate()?;
    let secret = config
        .app_secret()
        .ok_or("remote.app_secret is not set")?;
    let remote = HttpRemoteStore::from_config(&config.remote, &secret)?;
    let db = open_database(config)?;
    Ok(SyncService::new(config.sync.clone(), db, Arc::new(remote)))
}
