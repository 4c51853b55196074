//! devcaddy: the core of a live development server.
//!
//! Watchers observe the project tree, plugins transform changed files, and
//! the results land in a [`Store`] a serving layer reads from. The store
//! announces every change so clients can reload.

pub mod cli;
pub mod config;
pub mod file;
pub mod logging;
pub mod orchestrator;
pub mod plugin;
pub mod store;
pub mod watcher;

pub use config::Settings;
pub use file::{File, FileKind, FileOp, MergeSpec};
pub use orchestrator::{Orchestrator, StartError};
pub use store::Store;
