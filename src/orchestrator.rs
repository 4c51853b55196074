//! Wires watchers, plugins and the store together and tracks readiness.
//!
//! Startup order matters: the whole plugin graph is validated and every
//! watcher is built before the first scan, so configuration mistakes never
//! leave a half-running pipeline behind. The aggregator starts before the
//! scans because every dispatch has to drain into it. Watchers only start
//! handling live events once the store is ready, so readiness counts scan
//! results alone.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::config::{ConfigError, Settings};
use crate::file::{File, FileOp};
use crate::plugin::{PluginError, PluginRegistry};
use crate::store::Store;
use crate::watcher::{DebounceTable, MatchStrategy, WatchError, Watcher};

/// Why the pipeline could not start.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Watcher '{watcher}': {source}")]
    Watch {
        watcher: String,
        #[source]
        source: WatchError,
    },
}

/// A running pipeline.
///
/// Dropping it stops every watcher, plugin and the aggregator.
#[derive(Debug)]
pub struct Orchestrator {
    store: Arc<Store>,
    ready: watch::Receiver<bool>,
    registry: PluginRegistry,
    watchers: usize,
    crashes: mpsc::Receiver<PluginError>,
    tasks: JoinSet<()>,
}

impl Orchestrator {
    /// Build and start everything `settings` describes, then run the
    /// initial scan.
    ///
    /// Returns once every watcher has scanned; [`Orchestrator::wait_ready`]
    /// resolves once the scanned files have all reached the store.
    pub async fn start(settings: &Settings) -> Result<Self, StartError> {
        let configured = settings.root()?;
        let root = configured.canonicalize().map_err(|e| ConfigError::Root {
            reason: format!("{}: {e}", configured.display()),
        })?;

        let store = Arc::new(Store::new(&root));
        for declaration in &settings.files {
            store.declare(&declaration.name, declaration.merge_spec());
        }

        // Script paths are relative to the project root
        let plugins = settings
            .plugins
            .iter()
            .cloned()
            .map(|mut plugin| {
                plugin.path = plugin.path.map(|path| root.join(path));
                plugin
            })
            .collect();

        let (sink, results) = mpsc::channel(1);
        let mut registry = PluginRegistry::from_configs(plugins, sink)?;

        let debounce = Arc::new(DebounceTable::from_millis(settings.debounce_ms));
        let mut watchers = Vec::new();
        for config in settings.watchers() {
            let name = if config.name.is_empty() {
                MatchStrategy::default_name(&config)
            } else {
                config.name.clone()
            };

            let inputs = registry.inputs_for(&name, &config.plugins)?;
            let yielding = if config.plugins.is_empty() {
                1
            } else {
                config
                    .plugins
                    .iter()
                    .filter(|plugin| registry.chain_yields_output(plugin))
                    .count()
            };

            let watcher = Watcher::builder(&config)
                .root(&root)
                .outputs(inputs)
                .debounce(debounce.clone())
                .build()
                .map_err(|source| StartError::Watch {
                    watcher: name.clone(),
                    source,
                })?;
            watchers.push((watcher, yielding));
        }

        let (ready_tx, ready) = watch::channel(false);
        let (expected_tx, expected_rx) = oneshot::channel();
        let mut tasks = JoinSet::new();
        tasks.spawn(Aggregator::new(store.clone(), ready_tx).run(results, expected_rx));

        let exits = registry.process_exits();
        let (crash_tx, crashes) = mpsc::channel(exits.len().max(1));
        for (plugin, exit) in exits {
            tasks.spawn(report_crash(plugin, exit, crash_tx.clone()));
        }

        let watcher_count = watchers.len();
        let mut expected = 0;
        let mut scanned = Vec::with_capacity(watcher_count);
        for (mut watcher, yielding) in watchers {
            let dispatched = watcher.scan().await.map_err(|source| StartError::Watch {
                watcher: watcher.name().to_string(),
                source,
            })?;
            expected += dispatched * yielding;
            scanned.push(watcher);
        }

        // The aggregator only stops early if this side is gone
        let _ = expected_tx.send(expected);

        // OS events queue up in each watcher until the initial population is stored
        for watcher in scanned {
            let mut ready = ready.clone();
            tasks.spawn(async move {
                let started = ready.wait_for(|ready| *ready).await.is_ok();
                if started {
                    watcher.run().await;
                }
            });
        }

        crate::log_event!(
            "devcaddy",
            "started",
            "{watcher_count} watchers, {} plugins, expecting {expected} files",
            registry.len()
        );

        Ok(Self {
            store,
            ready,
            registry,
            watchers: watcher_count,
            crashes,
            tasks,
        })
    }

    /// The store served to clients.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Readiness flag; flips to true once and stays there.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the initial scan has fully populated the store.
    ///
    /// Returns false if the pipeline stopped first.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        ready.wait_for(|ready| *ready).await.is_ok()
    }

    /// Names of store entries as they change.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.store.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.len()
    }

    /// Resolve when a plugin's interpreter process dies.
    ///
    /// Pending forever for pipelines without interpreter processes.
    pub async fn crashed(&mut self) -> PluginError {
        match self.crashes.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Stop every task now.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
        crate::debug_event!("devcaddy", "stopped");
    }
}

/// Forward the exit of one interpreter process as a fatal error.
async fn report_crash(
    plugin: String,
    mut exit: watch::Receiver<Option<String>>,
    crashes: mpsc::Sender<PluginError>,
) {
    let status = match exit.wait_for(Option::is_some).await {
        Ok(status) => (*status).clone().unwrap_or_default(),
        // Plugin shut down with the pipeline
        Err(_) => return,
    };
    let _ = crashes.send(PluginError::Crashed { plugin, status }).await;
}

/// Moves plugin results into the store and decides when it is ready.
struct Aggregator {
    store: Arc<Store>,
    ready: watch::Sender<bool>,
    received: usize,
    expected: Option<usize>,
}

impl Aggregator {
    fn new(store: Arc<Store>, ready: watch::Sender<bool>) -> Self {
        Self {
            store,
            ready,
            received: 0,
            expected: None,
        }
    }

    async fn run(mut self, mut results: mpsc::Receiver<File>, mut expected: oneshot::Receiver<usize>) {
        loop {
            tokio::select! {
                count = &mut expected, if self.expected.is_none() => {
                    let Ok(count) = count else {
                        break;
                    };
                    self.expected = Some(count);
                    self.check_ready();
                }

                file = results.recv() => {
                    let Some(file) = file else {
                        break;
                    };
                    self.handle(file);
                }
            }
        }

        crate::debug_event!("aggregate", "stopped");
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn handle(&mut self, file: File) {
        let ready = self.is_ready();
        let source = file.plugin.clone().unwrap_or_else(|| "watcher".to_string());

        match file.op {
            FileOp::Log => {
                let text = file.content.trim();
                if !text.is_empty() {
                    crate::log_event!(source, "log", "{text}");
                }
            }
            FileOp::Create | FileOp::Write => {
                if ready {
                    self.store.put(&file.name, &file.content);
                    let event = if file.op == FileOp::Create {
                        "created"
                    } else {
                        "modified"
                    };
                    crate::log_event!("store", event, "{}", file.name);
                } else {
                    self.store.put_silent(&file.name, &file.content);
                }
            }
            FileOp::Remove | FileOp::Rename => {
                self.store.delete(&file.name);
                if ready {
                    crate::log_event!("store", "removed", "{}", file.name);
                }
            }
            FileOp::Error => {
                tracing::error!(
                    "[{source}] {}: {}",
                    file.name,
                    file.error.as_deref().unwrap_or("unknown error")
                );
            }
            FileOp::Chmod => {}
        }

        if !ready {
            self.received += 1;
            self.check_ready();
        }
    }

    fn check_ready(&mut self) {
        let Some(expected) = self.expected else {
            return;
        };
        if self.is_ready() || self.received < expected {
            return;
        }

        self.ready.send_replace(true);
        crate::log_event!(
            "store",
            "ready",
            "{} files defined in store",
            self.store.len()
        );
    }
}
