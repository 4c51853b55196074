use anyhow::Result;
use clap::Parser;

use devcaddy::cli::commands::{self, load_settings};
use devcaddy::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => commands::init::run_init(force),

        Commands::Config => {
            let settings = load_settings(cli.config.as_deref())?;
            commands::init::run_config(&settings)
        }

        Commands::Run { root } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            if let Some(root) = root {
                settings.root = Some(root);
            }
            devcaddy::logging::init_with_config(&settings.logging);
            commands::run::run(settings).await
        }
    }
}
