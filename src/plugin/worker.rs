//! Plugin worker loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{PluginConfig, Transform};
use crate::file::{File, FileOp};

/// A running plugin: a worker task fed through its input channel.
///
/// Inputs are processed one at a time in arrival order. A slow transform
/// stalls only this plugin's input.
#[derive(Debug)]
pub struct Plugin {
    name: String,
    input: mpsc::Sender<File>,
    handle: JoinHandle<()>,
}

impl Plugin {
    /// Start a worker for `config` sending results to `output`.
    pub fn spawn(
        config: &PluginConfig,
        transform: Arc<dyn Transform>,
        output: mpsc::Sender<File>,
    ) -> Self {
        let (input, rx) = mpsc::channel(1);
        Self::spawn_with_input(config, transform, input, rx, output)
    }

    /// Start a worker on an existing input channel. Used when pipe targets
    /// need the sender before the worker exists.
    pub(crate) fn spawn_with_input(
        config: &PluginConfig,
        transform: Arc<dyn Transform>,
        input: mpsc::Sender<File>,
        rx: mpsc::Receiver<File>,
        output: mpsc::Sender<File>,
    ) -> Self {
        let worker = Worker {
            name: config.name.clone(),
            log_only: config.log_only,
            no_output: config.no_output,
            transform,
        };
        let handle = tokio::spawn(worker.run(rx, output));

        Self {
            name: config.name.clone(),
            input,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sender feeding this plugin.
    pub fn input(&self) -> mpsc::Sender<File> {
        self.input.clone()
    }

    /// Queue `file` for this plugin; waits while the worker is busy.
    pub async fn submit(&self, file: File) -> bool {
        self.input.send(file).await.is_ok()
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Worker {
    name: String,
    log_only: bool,
    no_output: bool,
    transform: Arc<dyn Transform>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<File>, output: mpsc::Sender<File>) {
        while let Some(file) = rx.recv().await {
            // Errors pass through untouched
            if file.op == FileOp::Error {
                if output.send(file).await.is_err() {
                    break;
                }
                continue;
            }

            let out = self.transform.transform(file).await.produced_by(&self.name);

            if self.no_output {
                crate::debug_event!(&self.name, "discarded", "{}", out.name);
                continue;
            }

            let out = if self.log_only {
                out.with_op(FileOp::Log)
            } else {
                out
            };

            if output.send(out).await.is_err() {
                break;
            }
        }

        crate::debug_event!(&self.name, "stopped");
    }
}
