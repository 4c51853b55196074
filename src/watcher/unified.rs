//! The watcher: initial scan, then a steady-state event loop dispatching
//! matching files to plugins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use super::error::WatchError;
use super::event::{DebounceTable, Event};
use super::matcher::MatchStrategy;
use super::path_registry::PathRegistry;
use crate::config::WatchConfig;
use crate::file::{File, FileOp};

/// Observes a directory pattern or a file list and feeds plugin inputs.
///
/// Built with [`Watcher::builder`]. OS watches are registered at build time;
/// [`Watcher::scan`] performs the initial pass and [`Watcher::run`] handles
/// changes until the process exits.
pub struct Watcher {
    name: String,
    strategy: MatchStrategy,
    /// File whose content stands in for any matched change.
    proxy: Option<PathBuf>,
    /// Known members when every change dispatches the whole group.
    group: Option<BTreeMap<PathBuf, String>>,
    outputs: Vec<mpsc::Sender<File>>,
    debounce: Arc<DebounceTable>,
    registry: PathRegistry,
    events: mpsc::Receiver<notify::Result<notify::Event>>,
    fs_watcher: notify::RecommendedWatcher,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("proxy", &self.proxy)
            .field("group_all", &self.group.is_some())
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Create a builder for the watcher described by `config`.
    pub fn builder(config: &WatchConfig) -> WatcherBuilder {
        WatcherBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &MatchStrategy {
        &self.strategy
    }

    /// Number of plugin inputs each dispatch reaches.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Number of directories registered with the OS.
    pub fn watched_dirs(&self) -> usize {
        self.registry.dir_count()
    }

    /// Dispatch a synthetic Create for every matching file.
    ///
    /// Returns the number of dispatches: one per file, or a single one with a
    /// proxy or in group-all mode (none if nothing matched). An unreadable
    /// file aborts the scan.
    pub async fn scan(&mut self) -> Result<usize, WatchError> {
        let paths = self.strategy.current_files();
        if paths.is_empty() {
            crate::debug_event!(&self.name, "no files");
            return Ok(0);
        }

        if let Some(proxy) = &self.proxy {
            let file = read_initial(proxy)?;
            self.dispatch(file).await;
            return Ok(1);
        }

        if self.group.is_some() {
            let mut members = BTreeMap::new();
            for path in paths {
                let content = read_initial(&path)?.content;
                members.insert(path, content);
            }
            let file = File::new(self.name.clone(), join_group(&members), FileOp::Create);
            self.group = Some(members);
            self.dispatch(file).await;
            return Ok(1);
        }

        let mut count = 0;
        for path in paths {
            let event = Event::pseudo(&path, FileOp::Create);
            let file = read_initial(event.path())?;
            self.dispatch(file).await;
            count += 1;
        }

        crate::debug_event!(&self.name, "scanned", "{count} files");
        Ok(count)
    }

    /// Handle filesystem events until the process exits.
    pub async fn run(mut self) {
        crate::log_event!(
            &self.name,
            "watching",
            "{} in {} directories",
            self.strategy.dir().display(),
            self.registry.dir_count()
        );

        while let Some(res) = self.events.recv().await {
            match res {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    let err = WatchError::EventError {
                        details: e.to_string(),
                    };
                    tracing::error!("[{}] {err}", self.name);
                    let event = Event::pseudo_error(&self.name, err.to_string());
                    if let Some(file) = event.error_file() {
                        self.dispatch(file).await;
                    }
                }
            }
        }

        crate::debug_event!(&self.name, "stopped");
    }

    async fn handle_event(&mut self, raw: notify::Event) {
        for (index, path) in raw.paths.iter().enumerate() {
            let Some(op) = FileOp::from_event_kind(&raw.kind, index) else {
                continue;
            };

            // Directory bookkeeping is not debounced
            if op.is_deleted() && self.registry.contains(path) {
                self.forget_directory(path);
                continue;
            }

            let event = Event::new(path, op, &self.name);
            if !self.strategy.matches(path) {
                if self.strategy.discovers_directories() && event.is_new_directory() {
                    self.watch_new_directory(path);
                }
                continue;
            }

            if event.should_ignore(&self.debounce) {
                continue;
            }

            self.process(event).await;
        }
    }

    /// Resolve content for a matched event and dispatch it.
    async fn process(&mut self, event: Event) {
        let mut op = event.op();
        // A rename reported without its other end may name the new path
        if op == FileOp::Rename && event.path().exists() {
            op = FileOp::Create;
        }

        crate::debug_event!(&self.name, op, "{}", event.path().display());

        let file = if let Some(proxy) = &self.proxy {
            let op = if op.is_deleted() { FileOp::Write } else { op };
            read_or_error(proxy, op)
        } else if let Some(members) = &mut self.group {
            match update_group(members, event.path(), op) {
                Ok(()) if members.is_empty() => File::new(self.name.clone(), "", FileOp::Remove),
                Ok(()) => File::new(self.name.clone(), join_group(members), FileOp::Write),
                Err(e) => File::error(event.name(), e.to_string()),
            }
        } else {
            read_or_error(event.path(), op)
        };

        self.dispatch(file).await;
    }

    /// Send `file` to every plugin input concurrently and wait for all
    /// sends to be accepted.
    async fn dispatch(&self, file: File) {
        if let [output] = self.outputs.as_slice() {
            if output.send(file).await.is_err() {
                tracing::warn!("[{}] plugin input closed", self.name);
            }
            return;
        }

        let mut sends = JoinSet::new();
        for output in &self.outputs {
            let output = output.clone();
            let file = file.clone();
            sends.spawn(async move { output.send(file).await.is_ok() });
        }

        while let Some(sent) = sends.join_next().await {
            if !matches!(sent, Ok(true)) {
                tracing::warn!("[{}] plugin input closed", self.name);
            }
        }
    }

    /// Watch a directory created after startup, with its subdirectories.
    fn watch_new_directory(&mut self, dir: &Path) {
        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_dir() {
                if let Err(e) = self.watch_directory(entry.path()) {
                    tracing::warn!("[{}] {e}", self.name);
                }
            }
        }
    }

    fn watch_directory(&mut self, dir: &Path) -> Result<(), WatchError> {
        watch_directory(&mut self.fs_watcher, &mut self.registry, dir)
    }

    /// Drop a deleted directory and its subdirectories so they are watched
    /// again if they come back.
    fn forget_directory(&mut self, dir: &Path) {
        for removed in self.registry.remove_tree(dir) {
            // The OS usually dropped the watch along with the directory
            let _ = self.fs_watcher.unwatch(&removed);
            crate::debug_event!(&self.name, "unwatched", "{}", removed.display());
        }
    }
}

fn watch_directory(
    fs_watcher: &mut notify::RecommendedWatcher,
    registry: &mut PathRegistry,
    dir: &Path,
) -> Result<(), WatchError> {
    if !registry.add_dir(dir) {
        return Ok(());
    }

    match fs_watcher.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => {
            crate::debug_event!("watcher", "watching", "{}", dir.display());
            Ok(())
        }
        Err(e) => {
            registry.remove_dir(dir);
            Err(WatchError::PathWatchFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
}

fn read_initial(path: &Path) -> Result<File, WatchError> {
    File::read(path, FileOp::Create).map_err(|source| WatchError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn read_or_error(path: &Path, op: FileOp) -> File {
    File::read(path, op).unwrap_or_else(|e| {
        let name = path.to_string_lossy();
        tracing::warn!("[watcher] cannot read {name}: {e}");
        File::error(name, e.to_string())
    })
}

fn update_group(
    members: &mut BTreeMap<PathBuf, String>,
    path: &Path,
    op: FileOp,
) -> std::io::Result<()> {
    if op.is_deleted() {
        members.remove(path);
    } else {
        members.insert(path.to_path_buf(), std::fs::read_to_string(path)?);
    }
    Ok(())
}

fn join_group(members: &BTreeMap<PathBuf, String>) -> String {
    members
        .values()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builder for constructing a [`Watcher`].
pub struct WatcherBuilder {
    config: WatchConfig,
    root: Option<PathBuf>,
    outputs: Vec<mpsc::Sender<File>>,
    debounce: Option<Arc<DebounceTable>>,
}

impl WatcherBuilder {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            config: config.clone(),
            root: None,
            outputs: Vec::new(),
            debounce: None,
        }
    }

    /// Set the project root the config's paths are relative to.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Add a plugin input to dispatch to.
    pub fn output(mut self, output: mpsc::Sender<File>) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = mpsc::Sender<File>>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    /// Share a debounce table with other watchers.
    pub fn debounce(mut self, table: Arc<DebounceTable>) -> Self {
        self.debounce = Some(table);
        self
    }

    /// Build the watcher and register its OS watches.
    pub fn build(self) -> Result<Watcher, WatchError> {
        if self.outputs.is_empty() {
            return Err(WatchError::InitFailed {
                reason: "at least one plugin input is required".to_string(),
            });
        }

        let root = match self.root {
            Some(root) => root,
            None => std::env::current_dir().map_err(|e| WatchError::InitFailed {
                reason: e.to_string(),
            })?,
        };

        let name = if self.config.name.is_empty() {
            MatchStrategy::default_name(&self.config)
        } else {
            self.config.name.clone()
        };
        let strategy = MatchStrategy::from_config(&root, &self.config);

        let (tx, rx) = mpsc::channel(100);
        let mut fs_watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.blocking_send(res);
        })?;

        let mut registry = PathRegistry::new();
        match &strategy {
            MatchStrategy::Extension { dir, .. } => {
                if !dir.is_dir() {
                    return Err(WatchError::PathWatchFailed {
                        path: dir.clone(),
                        reason: "not a directory".to_string(),
                    });
                }
                for entry in WalkDir::new(dir) {
                    let entry = entry.map_err(|e| WatchError::PathWatchFailed {
                        path: dir.clone(),
                        reason: e.to_string(),
                    })?;
                    if entry.file_type().is_dir() {
                        watch_directory(&mut fs_watcher, &mut registry, entry.path())?;
                    }
                }
            }
            MatchStrategy::FileList { files, .. } => {
                let parents = PathRegistry::new().add_parents(files.iter().map(PathBuf::as_path));
                for dir in parents {
                    watch_directory(&mut fs_watcher, &mut registry, &dir)?;
                }
            }
        }

        crate::debug_event!(
            &name,
            "registered",
            "{} directories, {} plugin inputs",
            registry.dir_count(),
            self.outputs.len()
        );

        Ok(Watcher {
            name,
            strategy,
            proxy: self.config.proxy.as_ref().map(|p| root.join(p)),
            group: self.config.group_all.then(BTreeMap::new),
            outputs: self.outputs,
            debounce: self.debounce.unwrap_or_default(),
            registry,
            events: rx,
            fs_watcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        fs::create_dir_all(app.join("models")).unwrap();
        fs::write(app.join("a.js"), "a").unwrap();
        fs::write(app.join("models/b.js"), "b").unwrap();
        fs::write(app.join("c.css"), "c").unwrap();
        fs::write(app.join("index.js"), "index").unwrap();
        temp
    }

    fn app_js() -> WatchConfig {
        WatchConfig {
            name: "app".into(),
            dir: "app".into(),
            ext: "js".into(),
            ..WatchConfig::default()
        }
    }

    fn build(root: &Path, config: &WatchConfig) -> (Watcher, mpsc::Receiver<File>) {
        let (tx, rx) = mpsc::channel(16);
        let watcher = Watcher::builder(config)
            .root(root)
            .output(tx)
            .build()
            .unwrap();
        (watcher, rx)
    }

    fn os_event(kind: EventKind, path: &Path) -> notify::Event {
        notify::Event::new(kind).add_path(path.to_path_buf())
    }

    /// Swap the OS event stream for one the test feeds by hand.
    fn feed(watcher: &mut Watcher) -> mpsc::Sender<notify::Result<notify::Event>> {
        let (tx, events) = mpsc::channel(16);
        watcher.events = events;
        tx
    }

    /// Rename a staged file into `path` so its content is complete when the
    /// event lands.
    fn write_atomic(root: &Path, path: &Path, content: &str) {
        let staged = root.join("staged.tmp");
        fs::write(&staged, content).unwrap();
        fs::rename(&staged, path).unwrap();
    }

    async fn wait_for_content(rx: &mut mpsc::Receiver<File>, content: &str) -> File {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let file = rx.recv().await.unwrap();
                if file.content == content {
                    return file;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no file with content {content:?} was dispatched"))
    }

    fn drain(rx: &mut mpsc::Receiver<File>) -> Vec<File> {
        let mut files = Vec::new();
        while let Ok(file) = rx.try_recv() {
            files.push(file);
        }
        files
    }

    #[tokio::test]
    async fn test_scan_dispatches_each_match_in_order() {
        let temp = project();
        let (mut watcher, mut rx) = build(temp.path(), &app_js());

        assert_eq!(watcher.scan().await.unwrap(), 3);

        let files = drain(&mut rx);
        let names: Vec<_> = files.iter().map(|f| f.name.clone()).collect();
        let app = temp.path().join("app");
        assert_eq!(
            names,
            vec![
                app.join("a.js").to_string_lossy().into_owned(),
                app.join("index.js").to_string_lossy().into_owned(),
                app.join("models/b.js").to_string_lossy().into_owned(),
            ]
        );
        assert!(files.iter().all(|f| f.op == FileOp::Create));
        assert_eq!(files[0].content, "a");
    }

    #[tokio::test]
    async fn test_scan_with_proxy_dispatches_once() {
        let temp = project();
        let config = WatchConfig {
            proxy: Some("app/index.js".into()),
            ..app_js()
        };
        let (mut watcher, mut rx) = build(temp.path(), &config);

        assert_eq!(watcher.scan().await.unwrap(), 1);

        let files = drain(&mut rx);
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].name,
            temp.path().join("app/index.js").to_string_lossy()
        );
        assert_eq!(files[0].content, "index");
    }

    #[tokio::test]
    async fn test_scan_group_all_joins_members() {
        let temp = project();
        let config = WatchConfig {
            group_all: true,
            ..app_js()
        };
        let (mut watcher, mut rx) = build(temp.path(), &config);

        assert_eq!(watcher.scan().await.unwrap(), 1);

        let files = drain(&mut rx);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "app");
        assert_eq!(files[0].content, "a\nindex\nb");
    }

    #[tokio::test]
    async fn test_scan_file_list() {
        let temp = project();
        let config = WatchConfig {
            name: "bundle".into(),
            dir: "app".into(),
            files: vec!["models/b.js".into(), "a.js".into()],
            ..WatchConfig::default()
        };
        let (mut watcher, mut rx) = build(temp.path(), &config);

        assert_eq!(watcher.watched_dirs(), 2);
        assert_eq!(watcher.scan().await.unwrap(), 2);

        let contents: Vec<_> = drain(&mut rx).into_iter().map(|f| f.content).collect();
        assert_eq!(contents, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_scan_fans_out_to_every_output() {
        let temp = project();
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        let mut watcher = Watcher::builder(&app_js())
            .root(temp.path())
            .outputs([tx1, tx2])
            .build()
            .unwrap();

        assert_eq!(watcher.output_count(), 2);
        assert_eq!(watcher.scan().await.unwrap(), 3);
        assert_eq!(drain(&mut rx1).len(), 3);
        assert_eq!(drain(&mut rx2).len(), 3);
    }

    #[tokio::test]
    async fn test_missing_directory_fails_build() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = Watcher::builder(&app_js())
            .root(temp.path())
            .output(tx)
            .build()
            .unwrap_err();

        assert!(matches!(err, WatchError::PathWatchFailed { .. }));
    }

    #[tokio::test]
    async fn test_write_is_dispatched() {
        let temp = project();
        let (mut watcher, mut rx) = build(temp.path(), &app_js());
        watcher.scan().await.unwrap();
        drain(&mut rx);

        tokio::spawn(watcher.run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let path = temp.path().join("app/a.js");
        write_atomic(temp.path(), &path, "changed");

        let file = wait_for_content(&mut rx, "changed").await;
        assert_eq!(file.name, path.to_string_lossy());
    }

    #[tokio::test]
    async fn test_files_in_recreated_directory_are_dispatched() {
        let temp = project();
        let (mut watcher, mut rx) = build(temp.path(), &app_js());
        watcher.scan().await.unwrap();
        drain(&mut rx);

        tokio::spawn(watcher.run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sub = temp.path().join("app/sub");
        fs::create_dir(&sub).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        write_atomic(temp.path(), &sub.join("x.js"), "x");
        let file = wait_for_content(&mut rx, "x").await;
        assert_eq!(file.name, sub.join("x.js").to_string_lossy());

        fs::remove_dir_all(&sub).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        fs::create_dir(&sub).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        write_atomic(temp.path(), &sub.join("y.js"), "y");
        let file = wait_for_content(&mut rx, "y").await;
        assert_eq!(file.name, sub.join("y.js").to_string_lossy());
    }

    #[tokio::test]
    async fn test_deleted_directory_is_forgotten() {
        let temp = project();
        let (mut watcher, _rx) = build(temp.path(), &app_js());
        let sub = temp.path().join("app/sub");
        let deep = sub.join("deep");
        let before = watcher.watched_dirs();

        fs::create_dir_all(&deep).unwrap();
        watcher
            .handle_event(os_event(EventKind::Create(CreateKind::Folder), &sub))
            .await;
        assert!(watcher.registry.contains(&sub));
        assert!(watcher.registry.contains(&deep));
        assert_eq!(watcher.watched_dirs(), before + 2);

        fs::remove_dir_all(&sub).unwrap();
        watcher
            .handle_event(os_event(EventKind::Remove(RemoveKind::Folder), &sub))
            .await;
        assert!(!watcher.registry.contains(&sub));
        assert!(!watcher.registry.contains(&deep));
        assert_eq!(watcher.watched_dirs(), before);

        // Re-created right away, inside the debounce window
        fs::create_dir(&sub).unwrap();
        watcher
            .handle_event(os_event(EventKind::Create(CreateKind::Folder), &sub))
            .await;
        assert!(watcher.registry.contains(&sub));
    }

    #[tokio::test]
    async fn test_directory_matching_extension_is_dispatched() {
        let temp = project();
        let (mut watcher, mut rx) = build(temp.path(), &app_js());
        let dir = temp.path().join("app/vendor.js");

        fs::create_dir(&dir).unwrap();
        watcher
            .handle_event(os_event(EventKind::Create(CreateKind::Folder), &dir))
            .await;

        // Matched paths are read, not watched
        assert!(!watcher.registry.contains(&dir));
        let files = drain(&mut rx);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].op, FileOp::Error);
    }

    #[tokio::test]
    async fn test_watch_error_is_dispatched_as_error_file() {
        let temp = project();
        let (mut watcher, mut rx) = build(temp.path(), &app_js());
        let events = feed(&mut watcher);

        events
            .send(Err(notify::Error::generic("event queue overflow")))
            .await
            .unwrap();
        drop(events);
        watcher.run().await;

        let files = drain(&mut rx);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].op, FileOp::Error);
        assert_eq!(files[0].name, "app");
        assert!(
            files[0]
                .error
                .as_deref()
                .unwrap()
                .contains("event queue overflow")
        );
    }

    #[tokio::test]
    async fn test_repeats_inside_debounce_window_dispatch_once() {
        let temp = project();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = Watcher::builder(&app_js())
            .root(temp.path())
            .output(tx)
            .debounce(Arc::new(DebounceTable::from_millis(60_000)))
            .build()
            .unwrap();
        let events = feed(&mut watcher);

        let a = temp.path().join("app/a.js");
        let index = temp.path().join("app/index.js");
        let write = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        for path in [&a, &a, &index, &a] {
            events.send(Ok(os_event(write, path))).await.unwrap();
        }
        drop(events);
        watcher.run().await;

        let files = drain(&mut rx);
        let names: Vec<_> = files.iter().map(|f| f.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                a.to_string_lossy().into_owned(),
                index.to_string_lossy().into_owned()
            ]
        );
        assert!(files.iter().all(|f| f.op == FileOp::Write));
    }
}
