//! Filesystem watchers feeding the plugin pipeline.
//!
//! # Architecture
//!
//! ```text
//! Watcher (one per watch entry and per declared file)
//!   - own notify::RecommendedWatcher, non-recursive per directory
//!   - MatchStrategy: extension pattern or explicit file list
//!   - shared DebounceTable
//!         |
//!     fan-out to every configured plugin input
//! ```

mod error;
mod event;
mod matcher;
mod path_registry;
mod unified;

pub use error::WatchError;
pub use event::{DebounceTable, Event};
pub use matcher::MatchStrategy;
pub use path_registry::PathRegistry;
pub use unified::{Watcher, WatcherBuilder};

/// Window inside which repeated events for one identity are dropped.
pub const DEFAULT_DEBOUNCE_MS: u64 = 10;
