//! Transform stages between the watchers and the store.
//!
//! # Architecture
//!
//! ```text
//! Watcher --fan-out--> Plugin A --pipe--> Plugin B --+
//!        \                                           +--> aggregation --> Store
//!         +----------> Plugin C ---------------------+
//! ```
//!
//! Each plugin is a worker task fed by a channel. Its [`Transform`] is either
//! a one-shot command ([`CommandTransform`]), a request to a persistent
//! interpreter ([`BridgeTransform`]), or a pass-through ([`Identity`]).

pub mod bridge;
mod command;
mod config;
mod error;
mod registry;
mod worker;

pub use bridge::{BridgeAdapter, BridgeTransform, ProcessBridge, marshal};
pub use command::CommandTransform;
pub use config::{FILE_CONTENT_PLACEHOLDER, FILE_NAME_PLACEHOLDER, PluginConfig};
pub use error::{BridgeError, PluginError};
pub use registry::{IDENTITY_PLUGIN, PluginRegistry, PluginRegistryBuilder};
pub use worker::Plugin;

use async_trait::async_trait;

use crate::file::File;

/// A single file-to-file transformation.
///
/// Implementations never fail: problems are reported as an Error file.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, file: File) -> File;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

#[async_trait]
impl Transform for Identity {
    async fn transform(&self, file: File) -> File {
        file
    }
}

/// Adapts a plain function into a [`Transform`].
pub struct FnTransform<F>(pub F);

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(File) -> File + Send + Sync,
{
    async fn transform(&self, file: File) -> File {
        (self.0)(file)
    }
}
