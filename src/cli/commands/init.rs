//! Init and Config commands.

use anyhow::{Context, Result};

use crate::config::Settings;

/// Run init command - create configuration file.
pub fn run_init(force: bool) -> Result<()> {
    let path = Settings::init_config_file(force).context("Use --force to overwrite")?;
    println!("Created configuration file at: {}", path.display());
    println!("Edit this file to customize your settings.");
    Ok(())
}

/// Run config command - display current configuration.
pub fn run_config(config: &Settings) -> Result<()> {
    let json = serde_json::to_string_pretty(config).context("Error displaying config")?;
    println!("{json}");
    Ok(())
}
