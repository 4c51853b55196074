//! Error types for plugins and the process bridge.

use std::path::PathBuf;
use thiserror::Error;

/// Plugin errors. All of these are fatal: configuration problems stop
/// startup, a crashed interpreter stops the run.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error(
        "Could not determine the command for plugin '{plugin}'.\n\
         Commands are derived from the plugin path extension: .go (go run), .js (node), .rb (ruby)"
    )]
    UnknownCommand { plugin: String },

    #[error("Plugin has no name and none could be derived from its command or path")]
    Unnamed,

    #[error(
        "Duplicate plugin '{name}'. Plugins sharing a script path must be given distinct names"
    )]
    Duplicate { name: String },

    #[error("Plugin '{plugin}' pipes to '{target}', which is not defined")]
    UnknownPipeTarget { plugin: String, target: String },

    #[error("Plugin '{plugin}' is part of a pipe cycle")]
    PipeCycle { plugin: String },

    #[error("Plugin '{name}' is used by watcher '{watcher}' but not defined")]
    NotDefined { name: String, watcher: String },

    #[error("Plugin script for '{plugin}' not found: {}", path.display())]
    ScriptNotFound { plugin: String, path: PathBuf },

    #[error("Plugin '{plugin}' could not start its process: {source}")]
    Bridge {
        plugin: String,
        #[source]
        source: BridgeError,
    },

    #[error("Plugin '{plugin}' process exited unexpectedly ({status}); it is not restarted")]
    Crashed { plugin: String, status: String },
}

/// Errors from a persistent interpreter process.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open {stream} pipe")]
    MissingPipe { stream: &'static str },

    #[error("Failed to write request: {0}")]
    Write(#[source] std::io::Error),

    #[error("Process '{bridge}' exited")]
    Exited { bridge: String },

    /// The process reported a failure on stderr.
    #[error("{0}")]
    Script(String),
}
