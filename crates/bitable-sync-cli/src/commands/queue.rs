use std::path::Path;

use bitable_sync_core::sync::{OutboundQueue, QueueStatus, SyncLog};
use clap::Subcommand;

use super::{load_config, open_database, CliResult};

#[derive(Subcommand)]
pub enum QueueAction {
    /// List outbound queue items, newest first
    List {
        /// Only items with this status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<QueueStatus>,
        /// Maximum number of items
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove completed items and log entries past their retention
    Cleanup,
}

pub fn run(config_path: Option<&Path>, action: QueueAction) -> CliResult {
    let config = load_config(config_path)?;
    let db = open_database(&config)?;
    let queue = OutboundQueue::new(db.clone(), config.sync.max_retries);

    match action {
        QueueAction::List {
            status,
            limit,
            json,
        } => {
            let items = queue.list(status, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("no queue items");
            } else {
                for item in &items {
                    print!(
                        "#{:<6} {:<10} {:<6} {}:{} retries={}",
                        item.id,
                        item.status.as_str(),
                        item.action.as_str(),
                        item.table_name,
                        item.record_id,
                        item.retry_count
                    );
                    match &item.error_message {
                        Some(err) => println!(" error={err}"),
                        None => println!(),
                    }
                }
            }
        }
        QueueAction::Cleanup => {
            let queue_items = queue.cleanup(config.sync.queue_retention())?;
            let log_entries = SyncLog::new(db).cleanup(config.sync.log_retention())?;
            println!("removed {queue_items} queue items and {log_entries} log entries");
        }
    }
    Ok(())
}
