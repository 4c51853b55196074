//! Command implementations for the CLI.

pub mod init;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Settings;

/// Load settings from `path`, or from the nearest `devcaddy.json`.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Settings::load().context("failed to load configuration"),
    }
}
