//! Which paths a watcher is responsible for.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::WatchConfig;

/// Extension pattern under a directory, or an explicit list of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Every file under `dir` whose name ends with `.ext`. An empty `ext`
    /// matches every file.
    Extension { dir: PathBuf, ext: String },
    /// Exactly these files.
    FileList { dir: PathBuf, files: Vec<PathBuf> },
}

impl MatchStrategy {
    /// Resolve `config` against the project root.
    pub fn from_config(root: &Path, config: &WatchConfig) -> Self {
        let dir = root.join(&config.dir);
        if config.files.is_empty() {
            MatchStrategy::Extension {
                dir,
                ext: config.ext.trim_start_matches('.').to_string(),
            }
        } else {
            let files = config.files.iter().map(|f| dir.join(f)).collect();
            MatchStrategy::FileList { dir, files }
        }
    }

    pub fn dir(&self) -> &Path {
        match self {
            MatchStrategy::Extension { dir, .. } | MatchStrategy::FileList { dir, .. } => dir,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        match self {
            MatchStrategy::Extension { dir, ext } => {
                path.starts_with(dir)
                    && (ext.is_empty() || path.to_string_lossy().ends_with(&format!(".{ext}")))
            }
            MatchStrategy::FileList { files, .. } => files.iter().any(|f| f == path),
        }
    }

    /// Directories created later are watched only for extension patterns.
    pub fn discovers_directories(&self) -> bool {
        matches!(self, MatchStrategy::Extension { .. })
    }

    /// Files present right now. Extension matches come in sorted path order,
    /// listed files in list order. Entries that cannot be inspected are
    /// logged and skipped.
    pub fn current_files(&self) -> Vec<PathBuf> {
        match self {
            MatchStrategy::Extension { dir, .. } => {
                let mut found: Vec<PathBuf> = WalkDir::new(dir)
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            tracing::warn!("[watcher] problem getting files: {e}");
                            None
                        }
                    })
                    .filter(|entry| entry.file_type().is_file())
                    .map(walkdir::DirEntry::into_path)
                    .filter(|path| self.matches(path))
                    .collect();
                found.sort();
                found
            }
            MatchStrategy::FileList { files, .. } => files
                .iter()
                .filter(|path| {
                    let exists = path.is_file();
                    if !exists {
                        tracing::warn!("[watcher] listed file not found: {}", path.display());
                    }
                    exists
                })
                .cloned()
                .collect(),
        }
    }

    /// Watcher name when none is configured.
    pub fn default_name(config: &WatchConfig) -> String {
        if config.files.is_empty() {
            format!("{}:{}", config.dir, config.ext)
        } else {
            format!("{}:{}", config.dir, config.files.join(","))
        }
    }
}
