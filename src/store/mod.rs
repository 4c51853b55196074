//! Virtual file store served to the browser.
//!
//! Maps logical names to [`File`]s. Plain entries hold their content;
//! merge entries are recomputed from the other entries on every read so a
//! bundle always reflects the latest state of its parts.

mod notifications;

pub use notifications::StoreUpdates;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::file::{File, FileKind, FileOp, MergeSpec};

/// Concurrent name → file map with on-read merging.
#[derive(Debug)]
pub struct Store {
    /// Project root; merge directories are resolved against it.
    root: PathBuf,
    entries: RwLock<BTreeMap<String, File>>,
    updates: StoreUpdates,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(BTreeMap::new()),
            updates: StoreUpdates::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a merge entry. Declaring does not notify.
    pub fn declare(&self, name: &str, spec: MergeSpec) {
        self.entries
            .write()
            .insert(name.to_string(), File::merge(name, spec));
    }

    /// Upsert `name` and notify subscribers.
    pub fn put(&self, name: &str, content: &str) {
        self.put_silent(name, content);
        self.updates.send(name);
    }

    /// Upsert without notifying. Used while the store is first populated.
    pub fn put_silent(&self, name: &str, content: &str) {
        self.entries
            .write()
            .insert(name.to_string(), File::new(name, content, FileOp::Write));
    }

    /// Remove `name`. Subscribers are only notified if it existed.
    pub fn delete(&self, name: &str) {
        let removed = self.entries.write().remove(name);
        if removed.is_some() {
            self.updates.send(name);
        }
    }

    /// Content of `name`; merge entries are assembled now. Unknown names
    /// yield an empty string.
    pub fn get(&self, name: &str) -> String {
        let entries = self.entries.read();
        resolve(&entries, &self.root, name, &mut Vec::new())
    }

    /// The entry itself, with merge content filled in.
    pub fn get_file(&self, name: &str) -> Option<File> {
        let entries = self.entries.read();
        let file = entries.get(name)?;
        Some(materialize(&entries, &self.root, file))
    }

    /// Every entry, ordered by name.
    pub fn get_all(&self) -> Vec<File> {
        let entries = self.entries.read();
        entries
            .values()
            .map(|file| materialize(&entries, &self.root, file))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Stream of names whose entry was just put or deleted.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }
}

fn materialize(entries: &BTreeMap<String, File>, root: &Path, file: &File) -> File {
    if !file.is_merge() {
        return file.clone();
    }
    File {
        content: resolve(entries, root, &file.name, &mut Vec::new()),
        ..file.clone()
    }
}

/// Look up `name`, expanding merge entries. `stack` holds the merges being
/// expanded; a merge that refers back to itself contributes nothing.
fn resolve(
    entries: &BTreeMap<String, File>,
    root: &Path,
    name: &str,
    stack: &mut Vec<String>,
) -> String {
    let Some(file) = entries.get(name) else {
        return String::new();
    };

    match &file.kind {
        FileKind::Plain => file.content.clone(),
        FileKind::Merge(spec) => {
            if stack.iter().any(|n| n == name) {
                return String::new();
            }
            stack.push(name.to_string());
            let merged = merge(entries, root, spec, stack);
            stack.pop();
            merged
        }
    }
}

fn merge(
    entries: &BTreeMap<String, File>,
    root: &Path,
    spec: &MergeSpec,
    stack: &mut Vec<String>,
) -> String {
    let dir = root.join(&spec.dir);

    if !spec.files.is_empty() {
        return spec
            .files
            .iter()
            .map(|f| resolve(entries, root, &dir.join(f).to_string_lossy(), stack))
            .collect::<Vec<_>>()
            .join("\n");
    }

    let dir = dir.to_string_lossy();
    let suffix = format!(".{}", spec.ext);

    // BTreeMap iteration is already name-ordered
    entries
        .values()
        .filter(|f| !f.is_merge())
        .filter(|f| f.name.contains(dir.as_ref()) && f.name.ends_with(&suffix))
        .map(|f| f.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_js() -> MergeSpec {
        MergeSpec {
            dir: "app".into(),
            ext: "js".into(),
            files: vec![],
        }
    }

    fn populated() -> Store {
        let store = Store::new("/proj");
        store.declare("app.js", app_js());
        store.declare(
            "app.css",
            MergeSpec {
                dir: "app".into(),
                ext: "css".into(),
                files: vec![],
            },
        );
        store.declare(
            "vendor.js",
            MergeSpec {
                dir: "vendor".into(),
                ext: String::new(),
                files: vec!["qux/main.js".into(), "bax/index.js".into()],
            },
        );

        store.put("/proj/app/controllers/foo.js", "foo");
        store.put("/proj/app/models/bar.js", "bar");
        store.put("/proj/app/routes/baz.js", "baz");
        store.put("/proj/app/styles/app.css", "css");
        store.put("/proj/app/styles/foo.css", "foocss");
        store.put("/proj/app/templates/app.hbs", "hello");
        store.put("/proj/vendor/qux/main.js", "qux");
        store.put("/proj/vendor/bax/index.js", "bax");
        store.put("/proj/vendor/qux/qux.css", "qstyle");
        store
    }

    #[test]
    fn test_put_then_get_returns_content() {
        let store = Store::new("");
        store.put("index.html", "<html></html>");
        assert_eq!(store.get("index.html"), "<html></html>");

        store.put("index.html", "<html>2</html>");
        assert_eq!(store.get("index.html"), "<html>2</html>");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_name_is_empty() {
        let store = Store::new("");
        assert_eq!(store.get("nope.js"), "");
        assert!(store.get_file("nope.js").is_none());
    }

    #[test]
    fn test_merge_reflects_additions_and_deletions() {
        let store = Store::new("");
        store.declare("app.js", app_js());
        store.put("app/a.js", "x");
        store.put("app/b.js", "y");
        assert_eq!(store.get("app.js"), "x\ny");

        store.delete("app/a.js");
        assert_eq!(store.get("app.js"), "y");

        store.put("app/c.js", "z");
        assert_eq!(store.get("app.js"), "y\nz");
    }

    #[test]
    fn test_merge_by_extension() {
        let store = populated();
        assert_eq!(store.get("app.js"), "foo\nbar\nbaz");
        assert_eq!(store.get("app.css"), "css\nfoocss");

        store.put("/proj/app/controllers/app.js", "app");
        assert_eq!(store.get("app.js"), "app\nfoo\nbar\nbaz");
    }

    #[test]
    fn test_explicit_list_keeps_list_order() {
        let store = populated();
        assert_eq!(store.get("vendor.js"), "qux\nbax");
    }

    #[test]
    fn test_get_all_is_ordered_and_merged() {
        let store = populated();
        let files = store.get_all();

        assert_eq!(files.len(), 12);
        assert_eq!(files[0].name, "/proj/app/controllers/foo.js");
        assert_eq!(files[4].name, "/proj/app/styles/foo.css");

        let app = files.iter().find(|f| f.name == "app.js").unwrap();
        assert_eq!(app.content, "foo\nbar\nbaz");
    }

    #[test]
    fn test_self_referencing_merge_is_empty() {
        let store = Store::new("");
        store.declare(
            "loop.js",
            MergeSpec {
                dir: String::new(),
                ext: String::new(),
                files: vec!["loop.js".into()],
            },
        );
        assert_eq!(store.get("loop.js"), "");
    }

    #[test]
    fn test_put_and_delete_notify() {
        let store = Store::new("");
        let mut rx = store.subscribe();

        store.put("a.js", "1");
        store.delete("a.js");
        store.delete("a.js");
        store.put_silent("b.js", "2");

        assert_eq!(rx.try_recv().unwrap(), "a.js");
        assert_eq!(rx.try_recv().unwrap(), "a.js");
        assert!(rx.try_recv().is_err());
    }
}
