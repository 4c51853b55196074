//! Filesystem events normalized for the pipeline, and their debouncing.
//!
//! A single save often produces several OS notifications for the same path.
//! Events carry an identity (watcher name + raw path) and a creation instant;
//! the [`DebounceTable`] drops repeats of an identity inside the window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};
use parking_lot::Mutex;

use crate::file::{File, FileOp};

/// A normalized filesystem notification.
#[derive(Debug, Clone)]
pub struct Event {
    path: PathBuf,
    identity: String,
    at: Instant,
    op: FileOp,
    error: Option<String>,
}

impl Event {
    /// An OS event seen by `watcher`.
    pub fn new(path: impl Into<PathBuf>, op: FileOp, watcher: &str) -> Self {
        Self::at(path, op, watcher, Instant::now())
    }

    /// An OS event with an explicit creation instant.
    pub fn at(path: impl Into<PathBuf>, op: FileOp, watcher: &str, at: Instant) -> Self {
        let path = path.into();
        Self {
            identity: format!("{watcher}{}", path.display()),
            path,
            at,
            op,
            error: None,
        }
    }

    /// A synthetic event, e.g. one per file of the initial scan.
    pub fn pseudo(path: impl Into<PathBuf>, op: FileOp) -> Self {
        Self {
            path: path.into(),
            identity: String::new(),
            at: Instant::now(),
            op,
            error: None,
        }
    }

    /// A watch-subsystem failure surfaced as an event named `name`.
    pub fn pseudo_error(name: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::pseudo(name, FileOp::Error)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn op(&self) -> FileOp {
        self.op
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Chmod events and repeats inside the debounce window are dropped.
    ///
    /// Every non-Chmod call records this event as the latest for its
    /// identity.
    pub fn should_ignore(&self, table: &DebounceTable) -> bool {
        if self.op == FileOp::Chmod {
            return true;
        }
        table.check(&self.identity, self.at)
    }

    /// True for a Create whose path is a directory.
    pub fn is_new_directory(&self) -> bool {
        if self.op != FileOp::Create {
            return false;
        }
        match std::fs::metadata(&self.path) {
            Ok(meta) => meta.is_dir(),
            Err(e) => {
                tracing::warn!(
                    "[watcher] unable to get file info for {}: {e}",
                    self.path.display()
                );
                false
            }
        }
    }

    /// The error file this event stands for, if it is a failure.
    pub fn error_file(&self) -> Option<File> {
        self.error
            .as_ref()
            .map(|error| File::error(self.name(), error.clone()))
    }
}

impl FileOp {
    /// Map an OS event kind to an operation.
    ///
    /// `index` is the position of the path within the OS event; a rename
    /// reporting both ends lists the old path first. Access events carry no
    /// change and map to `None`.
    pub fn from_event_kind(kind: &EventKind, index: usize) -> Option<FileOp> {
        match kind {
            EventKind::Create(_) => Some(FileOp::Create),
            EventKind::Modify(ModifyKind::Metadata(_)) => Some(FileOp::Chmod),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::To => Some(FileOp::Create),
                RenameMode::Both if index > 0 => Some(FileOp::Create),
                _ => Some(FileOp::Rename),
            },
            EventKind::Modify(_) | EventKind::Any => Some(FileOp::Write),
            EventKind::Remove(_) => Some(FileOp::Remove),
            EventKind::Access(_) | EventKind::Other => None,
        }
    }
}

/// Last-seen instant per event identity.
///
/// Shared between watchers; identities include the watcher name so watchers
/// never suppress each other's events.
#[derive(Debug)]
pub struct DebounceTable {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl DebounceTable {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `at` for `identity`; true if the previous sighting was inside
    /// the window.
    fn check(&self, identity: &str, at: Instant) -> bool {
        let mut seen = self.seen.lock();
        let repeat = seen
            .get(identity)
            .is_some_and(|prev| at.saturating_duration_since(*prev) < self.window);
        seen.insert(identity.to_string(), at);
        repeat
    }
}

impl Default for DebounceTable {
    fn default() -> Self {
        Self::from_millis(super::DEFAULT_DEBOUNCE_MS)
    }
}
