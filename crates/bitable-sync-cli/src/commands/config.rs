use std::path::Path;

use bitable_sync_core::Config;
use clap::Subcommand;

use super::{config_path, CliResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write an example config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Check,
    /// Get a config value
    Get {
        /// Dotted key (e.g. "sync.batch_size", "sync.tables.0.remote_table")
        key: String,
    },
}

fn load(explicit: Option<&Path>) -> CliResult<Config> {
    let path = config_path(explicit)?;
    if !path.exists() {
        return Err(format!(
            "no config at {}; run `bitable-sync config init` first",
            path.display()
        )
        .into());
    }
    Ok(Config::load_from(&path)?)
}

pub fn run(explicit: Option<&Path>, action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Init { force } => {
            let path = config_path(explicit)?;
            if path.exists() && !force {
                return Err(format!("{} already exists (use --force)", path.display()).into());
            }
            Config::example().save_to(&path)?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Show => {
            let config = load(explicit)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path(explicit)?.display());
        }
        ConfigAction::Check => {
            let config = load(explicit)?;
            config.validate()?;
            println!("ok: {} table mapping(s)", config.sync.tables.len());
        }
        ConfigAction::Get { key } => {
            let config = load(explicit)?;
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => return Err(format!("unknown key: {key}").into()),
            }
        }
    }
    Ok(())
}
