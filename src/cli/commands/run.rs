//! Run command: start the pipeline and report changes until interrupted.

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast::error::RecvError;

use crate::config::Settings;
use crate::orchestrator::Orchestrator;

pub async fn run(settings: Settings) -> Result<()> {
    let mut orchestrator = Orchestrator::start(&settings)
        .await
        .context("failed to start")?;
    let mut updates = orchestrator.subscribe();

    if !orchestrator.wait_ready().await {
        bail!("pipeline stopped before the store was populated");
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(name) => crate::debug_event!("reload", "notify", "{name}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[reload] skipped {skipped} notifications");
                }
                Err(RecvError::Closed) => break,
            },

            err = orchestrator.crashed() => {
                orchestrator.shutdown().await;
                return Err(err.into());
            }

            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("[devcaddy] failed to listen for ctrl+c: {e}");
                }
                eprintln!("Received shutdown signal");
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
