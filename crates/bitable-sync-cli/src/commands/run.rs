//! `run`: start the service and block until Ctrl-C.

use std::path::Path;
use std::time::Duration;

use super::{build_service, load_config, CliResult};

pub fn run(config_path: Option<&Path>, status_interval: u64) -> CliResult {
    let config = load_config(config_path)?;
    let service = build_service(&config)?;
    service.start()?;
    println!(
        "syncing {} table(s); press Ctrl-C to stop",
        config.sync.tables.len()
    );

    // The service runs on its own threads; this runtime only waits for the
    // signal and paces the status log.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let interval = Duration::from_secs(status_interval.max(1));
    let waited: std::io::Result<()> = runtime.block_on(async {
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => return signal,
                _ = tokio::time::sleep(interval) => {
                    match service.status() {
                        Ok(status) => tracing::info!(
                            uptime_seconds = status.uptime_seconds,
                            pulled = status.remote_to_relational.applied,
                            pushed = status.relational_to_remote.applied,
                            failed = status.remote_to_relational.failed + status.relational_to_remote.failed,
                            pending = status.queue.pending,
                            "sync status"
                        ),
                        Err(e) => tracing::warn!(error = %e, "failed to read status"),
                    }
                }
            }
        }
    });

    println!("stopping...");
    service.stop();
    waited?;
    Ok(())
}
