//! Bookkeeping for the directories a watcher has registered with the OS.
//!
//! OS watches are non-recursive, so every directory is registered on its
//! own. The registry remembers which ones already are, so a directory is
//! never watched twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Directories registered for watching.
#[derive(Debug, Default)]
pub struct PathRegistry {
    watch_dirs: HashSet<PathBuf>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a directory; true if it was not yet registered.
    pub fn add_dir(&mut self, dir: impl Into<PathBuf>) -> bool {
        self.watch_dirs.insert(dir.into())
    }

    /// Record the parent directory of each file, returning directories not
    /// seen before in first-seen order.
    pub fn add_parents<'a>(&mut self, files: impl IntoIterator<Item = &'a Path>) -> Vec<PathBuf> {
        let mut new_dirs = Vec::new();

        for file in files {
            let parent = match file.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if self.watch_dirs.insert(parent.clone()) {
                new_dirs.push(parent);
            }
        }

        new_dirs
    }

    /// Forget a directory, e.g. after a failed watch.
    pub fn remove_dir(&mut self, dir: &Path) {
        self.watch_dirs.remove(dir);
    }

    /// Forget a deleted directory and everything registered below it,
    /// returning what was removed.
    pub fn remove_tree(&mut self, dir: &Path) -> Vec<PathBuf> {
        let mut removed: Vec<PathBuf> = self
            .watch_dirs
            .iter()
            .filter(|watched| watched.starts_with(dir))
            .cloned()
            .collect();
        removed.sort();

        for watched in &removed {
            self.watch_dirs.remove(watched);
        }
        removed
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.watch_dirs.contains(dir)
    }

    /// Get count of watched directories.
    pub fn dir_count(&self) -> usize {
        self.watch_dirs.len()
    }
}
