//! `once`: a single pass in each direction.

use std::path::Path;

use super::{build_service, load_config, CliResult};

pub fn run(config_path: Option<&Path>, json: bool) -> CliResult {
    let config = load_config(config_path)?;
    let service = build_service(&config)?;
    service.prepare()?;
    let report = service.run_once();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for (label, counts) in [
        ("remote -> relational", report.remote_to_relational),
        ("relational -> remote", report.relational_to_remote),
    ] {
        println!(
            "{label}: {} applied, {} skipped, {} failed",
            counts.applied, counts.skipped, counts.failed
        );
    }
    Ok(())
}
