//! The value that flows through the pipeline.
//!
//! A [`File`] is produced by a watcher, rebuilt by every plugin stage and
//! finally consumed by the store. Stages take a `File` by value and return a
//! new one; nothing mutates a file another task can still see.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Token a command plugin prints to rename its output.
///
/// Everything before the marker is content, the trimmed text after it is the
/// new file name.
pub const OUTPUT_NAME_MARKER: &str = "__SERVER_FILE_PATH__=";

/// What happened to a file, or what kind of payload it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    /// Diagnostic output, never stored.
    Log,
    /// A failed stage; `File::error` carries the reason.
    Error,
}

impl FileOp {
    /// Remove and Rename both mean the path no longer holds content.
    pub fn is_deleted(self) -> bool {
        matches!(self, FileOp::Remove | FileOp::Rename)
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileOp::Create => "create",
            FileOp::Write => "write",
            FileOp::Remove => "remove",
            FileOp::Rename => "rename",
            FileOp::Chmod => "chmod",
            FileOp::Log => "log",
            FileOp::Error => "error",
        };
        f.write_str(s)
    }
}

/// Describes how a merge entry is assembled from other store entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Directory (relative to the store root) the constituents live in.
    #[serde(default)]
    pub dir: String,
    /// Extension without the leading dot. Ignored when `files` is set.
    #[serde(default)]
    pub ext: String,
    /// Explicit constituents relative to `dir`, joined in this order.
    #[serde(default)]
    pub files: Vec<String>,
}

/// Plain content, or an entry recomputed from other entries on every read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FileKind {
    #[default]
    Plain,
    Merge(MergeSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub content: String,
    pub op: FileOp,
    pub error: Option<String>,
    pub kind: FileKind,
    /// Plugin that produced this value, if any.
    pub plugin: Option<String>,
}

impl File {
    pub fn new(name: impl Into<String>, content: impl Into<String>, op: FileOp) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            op,
            error: None,
            kind: FileKind::Plain,
            plugin: None,
        }
    }

    /// A failed stage for `name`.
    pub fn error(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(name, "", FileOp::Error)
        }
    }

    /// A merge entry with no content of its own.
    pub fn merge(name: impl Into<String>, spec: MergeSpec) -> Self {
        Self {
            kind: FileKind::Merge(spec),
            ..Self::new(name, "", FileOp::Create)
        }
    }

    /// Read `path` from disk. Deleted files carry no content and are not read.
    pub fn read(path: &Path, op: FileOp) -> std::io::Result<Self> {
        let name = path.to_string_lossy().into_owned();
        if op.is_deleted() {
            return Ok(Self::new(name, "", op));
        }

        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(name, content, op))
    }

    /// Build the result of an external command run on `input`.
    ///
    /// A failed run turns the result into an Error file. Output containing
    /// [`OUTPUT_NAME_MARKER`] renames the result.
    pub fn from_command(input: &File, output: &str, failure: Option<String>) -> Self {
        let mut file = Self::new(input.name.clone(), output, input.op);

        if let Some((content, name)) = output.split_once(OUTPUT_NAME_MARKER) {
            file.content = content.to_string();
            file.name = name.trim().to_string();
        }

        if let Some(reason) = failure {
            file.op = FileOp::Error;
            file.error = Some(reason);
        }

        file
    }

    pub fn is_deleted(&self) -> bool {
        self.op.is_deleted()
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.kind, FileKind::Merge(_))
    }

    /// Same file, different op.
    pub fn with_op(self, op: FileOp) -> Self {
        Self { op, ..self }
    }

    /// Tag the file with the plugin that produced it.
    pub fn produced_by(self, plugin: impl Into<String>) -> Self {
        Self {
            plugin: Some(plugin.into()),
            ..self
        }
    }
}
