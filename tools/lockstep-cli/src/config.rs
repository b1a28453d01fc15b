//! Config command - print or write the effective configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use lockstep_shared::AppConfig;
use lockstep_shared::config::default_config_path;

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Write the effective configuration back to disk
    #[arg(long)]
    pub write: bool,
}

/// Execute the config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    let path = match args.path {
        Some(path) => path,
        None => default_config_path().context("No platform config directory available")?,
    };

    let config = AppConfig::load_from(&path).context("Failed to load configuration")?;

    if args.write {
        config
            .save_to(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration written");
    }

    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config).context("Failed to serialize configuration")?);
    Ok(())
}
