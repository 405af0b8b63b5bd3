use std::path::Path;

use bitable_sync_core::sync::{SnapshotStore, SqliteSnapshotStore};
use clap::Subcommand;

use super::{load_config, open_database, CliResult};

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// Forget a table's snapshot; the next pass re-reads every remote record
    Reset {
        /// Relational table name as configured
        table: String,
    },
}

pub fn run(config_path: Option<&Path>, action: SnapshotAction) -> CliResult {
    match action {
        SnapshotAction::Reset { table } => {
            let config = load_config(config_path)?;
            if config.sync.table(&table).is_none() {
                return Err(format!("no table mapping for '{table}'").into());
            }
            let db = open_database(&config)?;
            SqliteSnapshotStore::new(db).reset(&table)?;
            println!("snapshot of {table} reset");
        }
    }
    Ok(())
}
