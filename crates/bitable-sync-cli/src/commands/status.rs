//! `status`: queue and log statistics read straight from the database.
//!
//! Works while a `run` process holds the same database.

use std::path::Path;

use bitable_sync_core::sync::{IdentityMap, LogStatus, OutboundQueue, SyncLog};
use chrono::Utc;
use serde_json::json;

use super::{load_config, open_database, CliResult};

pub fn run(config_path: Option<&Path>, json_output: bool) -> CliResult {
    let config = load_config(config_path)?;
    let db = open_database(&config)?;
    let queue = OutboundQueue::new(db.clone(), config.sync.max_retries).stats()?;
    let log = SyncLog::new(db.clone());
    let identity = IdentityMap::new(db.clone());

    let mut tables = serde_json::Map::new();
    for mapping in &config.sync.tables {
        tables.insert(
            mapping.relational_table.clone(),
            json!({
                "remote_table": mapping.remote_table,
                "mapped_records": identity.count(&mapping.relational_table)?,
            }),
        );
    }

    let status = json!({
        "database": config.database_path()?,
        "queue": queue,
        "oldest_pending_age_seconds": queue.oldest_pending_age_seconds(Utc::now()),
        "log": {
            "completed": log.count(LogStatus::Completed)?,
            "skipped": log.count(LogStatus::Skipped)?,
            "failed": log.count(LogStatus::Failed)?,
        },
        "tables": tables,
    });

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Database: {}", status["database"].as_str().unwrap_or("-"));
    println!(
        "Queue:    {} pending, {} processing, {} completed, {} failed",
        queue.pending, queue.processing, queue.completed, queue.failed
    );
    if let Some(age) = status["oldest_pending_age_seconds"].as_i64() {
        println!("          oldest pending item waiting {age}s");
    }
    println!(
        "Log:      {} completed, {} skipped, {} failed",
        status["log"]["completed"], status["log"]["skipped"], status["log"]["failed"]
    );
    for (name, table) in &tables {
        println!(
            "Table:    {name} <-> {} ({} mapped)",
            table["remote_table"].as_str().unwrap_or("-"),
            table["mapped_records"]
        );
    }
    Ok(())
}
