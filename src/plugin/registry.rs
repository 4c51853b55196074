//! Plugin registry: validates the plugin graph and wires the channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{
    BridgeAdapter, BridgeTransform, CommandTransform, Identity, Plugin, PluginConfig, PluginError,
    ProcessBridge, Transform,
};
use crate::file::File;

/// Name reserved for the pass-through plugin of watchers without plugins.
pub const IDENTITY_PLUGIN: &str = "_identity_";

/// Exit status of an interpreter process, set if it ends on its own.
type ProcessExit = watch::Receiver<Option<String>>;

/// All configured plugins, running and wired together.
///
/// Plugins with `pipe_to` send to their target's input; every other plugin
/// sends to the sink (the orchestrator's aggregation channel).
#[derive(Debug)]
pub struct PluginRegistry {
    plugins: HashMap<String, Plugin>,
    configs: HashMap<String, PluginConfig>,
    identities: Vec<Plugin>,
    sink: mpsc::Sender<File>,
    exits: Vec<(String, ProcessExit)>,
}

impl PluginRegistry {
    pub fn builder(sink: mpsc::Sender<File>) -> PluginRegistryBuilder {
        PluginRegistryBuilder::new(sink)
    }

    /// Build every plugin described by `configs`.
    ///
    /// Script plugins start their interpreter process here; any failure is a
    /// configuration error.
    pub fn from_configs(
        configs: Vec<PluginConfig>,
        sink: mpsc::Sender<File>,
    ) -> Result<Self, PluginError> {
        let mut builder = Self::builder(sink);
        let mut exits = Vec::new();
        for config in configs {
            let config = config.resolve()?;
            // Reject duplicates before starting any process
            builder.check_unique(&config.name)?;
            let (transform, exit) = transform_for(&config)?;
            if let Some(exit) = exit {
                exits.push((config.name.clone(), exit));
            }
            builder = builder.add(config, transform);
        }

        let mut registry = builder.build()?;
        registry.exits = exits;
        Ok(registry)
    }

    /// Exit watches of every interpreter process, by plugin name.
    pub fn process_exits(&self) -> Vec<(String, ProcessExit)> {
        self.exits.clone()
    }

    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Input senders for the named plugins of `watcher`.
    ///
    /// No names yields a private pass-through plugin.
    pub fn inputs_for(
        &mut self,
        watcher: &str,
        names: &[String],
    ) -> Result<Vec<mpsc::Sender<File>>, PluginError> {
        if names.is_empty() {
            return Ok(vec![self.identity()]);
        }

        names
            .iter()
            .map(|name| {
                self.plugins
                    .get(name)
                    .map(Plugin::input)
                    .ok_or_else(|| PluginError::NotDefined {
                        name: name.clone(),
                        watcher: watcher.to_string(),
                    })
            })
            .collect()
    }

    /// Start a fresh pass-through plugin feeding the sink.
    pub fn identity(&mut self) -> mpsc::Sender<File> {
        let config = PluginConfig {
            name: IDENTITY_PLUGIN.to_string(),
            ..PluginConfig::default()
        };
        let plugin = Plugin::spawn(&config, Arc::new(Identity), self.sink.clone());
        let input = plugin.input();
        self.identities.push(plugin);
        input
    }

    /// Whether a file submitted to `name` eventually reaches the sink.
    ///
    /// False when any stage of its pipe chain discards output. Unknown names
    /// (and the pass-through plugin) always reach it.
    pub fn chain_yields_output(&self, name: &str) -> bool {
        let mut current = name;
        let mut visited = HashSet::new();
        while let Some(config) = self.configs.get(current) {
            if config.no_output || !visited.insert(current) {
                return false;
            }
            match config.pipe_to.as_deref() {
                Some(next) => current = next,
                None => return true,
            }
        }
        true
    }
}

/// The transform a resolved config describes, with the exit watch of its
/// process if it runs one.
fn transform_for(
    config: &PluginConfig,
) -> Result<(Arc<dyn Transform>, Option<ProcessExit>), PluginError> {
    if !config.is_bridge() {
        return Ok((Arc::new(CommandTransform::new(config.clone())), None));
    }

    let adapter =
        BridgeAdapter::for_command(&config.command).ok_or_else(|| PluginError::UnknownCommand {
            plugin: config.name.clone(),
        })?;

    let path = config.path.clone().unwrap_or_default();
    if !path.is_file() {
        return Err(PluginError::ScriptNotFound {
            plugin: config.name.clone(),
            path,
        });
    }

    let settings = config.opts.clone().unwrap_or_else(|| serde_json::json!({}));
    let bridge = ProcessBridge::spawn(&config.name, adapter.command(&path, &settings)).map_err(
        |source| PluginError::Bridge {
            plugin: config.name.clone(),
            source,
        },
    )?;

    let exit = bridge.exited();
    Ok((Arc::new(BridgeTransform::new(bridge)), Some(exit)))
}

/// Collects plugins, then validates and starts them together.
pub struct PluginRegistryBuilder {
    entries: Vec<(PluginConfig, Arc<dyn Transform>)>,
    sink: mpsc::Sender<File>,
}

impl PluginRegistryBuilder {
    pub fn new(sink: mpsc::Sender<File>) -> Self {
        Self {
            entries: Vec::new(),
            sink,
        }
    }

    /// Add a plugin with an explicit transform.
    pub fn add(mut self, config: PluginConfig, transform: Arc<dyn Transform>) -> Self {
        self.entries.push((config, transform));
        self
    }

    fn check_unique(&self, name: &str) -> Result<(), PluginError> {
        if self.entries.iter().any(|(c, _)| c.name == name) {
            return Err(PluginError::Duplicate {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Validate names and pipes, then start every worker.
    pub fn build(self) -> Result<PluginRegistry, PluginError> {
        let mut configs: HashMap<String, PluginConfig> = HashMap::new();
        for (config, _) in &self.entries {
            if config.name.is_empty() {
                return Err(PluginError::Unnamed);
            }
            if configs
                .insert(config.name.clone(), config.clone())
                .is_some()
            {
                return Err(PluginError::Duplicate {
                    name: config.name.clone(),
                });
            }
        }

        validate_pipes(&configs)?;

        // Inputs first, so pipe sources can hold their target's sender
        let mut channels: HashMap<String, (mpsc::Sender<File>, mpsc::Receiver<File>)> = configs
            .keys()
            .map(|name| (name.clone(), mpsc::channel(1)))
            .collect();
        let inputs: HashMap<String, mpsc::Sender<File>> = channels
            .iter()
            .map(|(name, (tx, _))| (name.clone(), tx.clone()))
            .collect();

        let mut plugins = HashMap::new();
        for (config, transform) in self.entries {
            let Some((input, rx)) = channels.remove(&config.name) else {
                continue;
            };
            let output = match config.pipe_to.as_deref() {
                Some(target) => inputs[target].clone(),
                None => self.sink.clone(),
            };

            crate::debug_event!(
                "plugins",
                "started",
                "{} -> {}",
                config.name,
                config.pipe_to.as_deref().unwrap_or("store")
            );
            let plugin = Plugin::spawn_with_input(&config, transform, input, rx, output);
            plugins.insert(config.name.clone(), plugin);
        }

        Ok(PluginRegistry {
            plugins,
            configs,
            identities: Vec::new(),
            sink: self.sink,
            exits: Vec::new(),
        })
    }
}

/// Every pipe target exists and no chain loops back on itself.
fn validate_pipes(configs: &HashMap<String, PluginConfig>) -> Result<(), PluginError> {
    for config in configs.values() {
        if let Some(target) = &config.pipe_to {
            if !configs.contains_key(target) {
                return Err(PluginError::UnknownPipeTarget {
                    plugin: config.name.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    for start in configs.keys() {
        let mut visited = HashSet::new();
        let mut current = start.as_str();
        while let Some(next) = configs[current].pipe_to.as_deref() {
            if !visited.insert(current) {
                return Err(PluginError::PipeCycle {
                    plugin: start.clone(),
                });
            }
            current = next;
        }
    }

    Ok(())
}
