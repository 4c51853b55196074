//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "devcaddy",
    version,
    about = "Watch a project, run changed files through plugins, serve the results",
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to a devcaddy.json file
    #[arg(short, long, global = true, env = "DEVCADDY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter configuration
    #[command(about = "Create devcaddy.json in the current directory")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Start watching and transforming
    #[command(
        about = "Watch the project and keep the store up to date",
        after_help = "Examples:\n  devcaddy run\n  devcaddy run --root ./site\n  RUST_LOG=debug devcaddy run"
    )]
    Run {
        /// Project root (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Show current configuration settings
    #[command(about = "Display the effective settings as JSON")]
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_root_and_global_config() {
        let cli = Cli::try_parse_from([
            "devcaddy",
            "run",
            "--root",
            "site",
            "--config",
            "site/devcaddy.json",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("site/devcaddy.json")));
        assert!(matches!(cli.command, Commands::Run { root: Some(r) } if r == PathBuf::from("site")));
    }

    #[test]
    fn test_init_force() {
        let cli = Cli::try_parse_from(["devcaddy", "init", "-f"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { force: true }));
    }
}
