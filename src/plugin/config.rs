//! Plugin configuration and argument templating.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::PluginError;
use crate::file::File;

/// Placeholder replaced with the input file's name.
pub const FILE_NAME_PLACEHOLDER: &str = "{{fileName}}";
/// Placeholder replaced with the input file's content.
pub const FILE_CONTENT_PLACEHOLDER: &str = "{{fileContent}}";

/// Interpreter used when a plugin only names its script.
fn command_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "go" => Some("go run"),
        "js" => Some("node"),
        "rb" => Some("ruby"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Registry name. Derived from `path` or `command` when empty.
    #[serde(default)]
    pub name: String,

    /// Program to run; may carry leading arguments (`go run`).
    #[serde(default)]
    pub command: String,

    /// Space-separated argument template.
    #[serde(default)]
    pub args: String,

    /// Plugin script. A `.js` script runs in a persistent node process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Send output to this plugin instead of the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_to: Option<String>,

    /// Settings handed to bridge plugins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<serde_json::Value>,

    /// Output is diagnostic only.
    #[serde(default)]
    pub log_only: bool,

    /// Run for side effects; output is discarded.
    #[serde(default)]
    pub no_output: bool,
}

impl PluginConfig {
    /// Fill in `command` and `name` where the config leaves them out.
    pub fn resolve(mut self) -> Result<Self, PluginError> {
        let ext = self
            .path
            .as_deref()
            .and_then(Path::extension)
            .map(|e| e.to_string_lossy().into_owned());

        if self.name.is_empty() {
            self.name = match &self.path {
                Some(path) => path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                None => self.command.clone(),
            };
        }

        if self.command.is_empty() {
            self.command = ext
                .as_deref()
                .and_then(command_for_extension)
                .ok_or_else(|| PluginError::UnknownCommand {
                    plugin: self.name.clone(),
                })?
                .to_string();
        }

        if self.name.is_empty() {
            return Err(PluginError::Unnamed);
        }
        Ok(self)
    }

    /// Whether this plugin runs in a persistent interpreter process.
    pub fn is_bridge(&self) -> bool {
        self.path
            .as_deref()
            .and_then(Path::extension)
            .is_some_and(|ext| ext == "js")
    }

    /// Program and its leading arguments, split from `command`.
    pub fn program(&self) -> (String, Vec<String>) {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }

    /// Arguments for one run on `file`.
    ///
    /// Without any placeholder in the template, name and content are
    /// appended as the last two arguments.
    pub fn injected_args(&self, file: &File) -> Vec<String> {
        let mut template = self.args.clone();
        if !template.contains(FILE_NAME_PLACEHOLDER) && !template.contains(FILE_CONTENT_PLACEHOLDER)
        {
            template.push_str(&format!(" {FILE_NAME_PLACEHOLDER} {FILE_CONTENT_PLACEHOLDER}"));
        }

        template
            .split(' ')
            .filter(|arg| !arg.is_empty())
            .map(|arg| {
                arg.replace(FILE_NAME_PLACEHOLDER, &file.name)
                    .replace(FILE_CONTENT_PLACEHOLDER, &file.content)
            })
            .collect()
    }
}
