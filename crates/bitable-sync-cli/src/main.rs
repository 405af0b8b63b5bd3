use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "bitable-sync", version, about = "Bidirectional Bitable <-> SQLite replication")]
struct Cli {
    /// Config file (defaults to ~/.config/bitable-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication loops until Ctrl-C
    Run {
        /// Seconds between status log lines
        #[arg(long, default_value_t = 60)]
        status_interval: u64,
    },
    /// Run one pass in each direction and exit
    Once {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue and log statistics from the database
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remote snapshot management
    Snapshot {
        #[command(subcommand)]
        action: commands::snapshot::SnapshotAction,
    },
    /// Outbound queue management
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run { status_interval } => commands::run::run(config, status_interval),
        Commands::Once { json } => commands::once::run(config, json),
        Commands::Status { json } => commands::status::run(config, json),
        Commands::Snapshot { action } => commands::snapshot::run(config, action),
        Commands::Queue { action } => commands::queue::run(config, action),
        Commands::Config { action } => commands::config::run(config, action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
