//! Configuration for the dev server.
//!
//! Settings are layered:
//! - Default values
//! - `devcaddy.json` in the current directory or the nearest ancestor
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `DEVCADDY_` and use double
//! underscores to separate nested levels:
//! - `DEVCADDY_ROOT=../site` sets `root`
//! - `DEVCADDY_DEBOUNCE_MS=25` sets `debounce_ms`
//! - `DEVCADDY_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::file::MergeSpec;
use crate::plugin::PluginConfig;
use crate::watcher::DEFAULT_DEBOUNCE_MS;

/// Name of the configuration file looked up from the working directory.
pub const CONFIG_FILE_NAME: &str = "devcaddy.json";

/// Errors while loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file was not found: {}\nCreate one with 'devcaddy init'", path.display())]
    NotFound { path: PathBuf },

    #[error("Please check your configuration JSON syntax: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("Unable to determine the project root: {reason}")]
    Root { reason: String },

    #[error("Invalid file definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Config file already exists: {}. Use --force to overwrite", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Project root. Relative roots are resolved against the config file's
    /// directory; when absent the config file's directory is the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Window within which repeated events for one path collapse into one.
    #[serde(default = "default_debounce_ms", alias = "debounceMs")]
    pub debounce_ms: u64,

    /// Transform stages.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Directories or file lists routed through plugins.
    #[serde(default)]
    pub watch: Vec<WatchConfig>,

    /// Declared store entries, each merged from its constituents.
    #[serde(default)]
    pub files: Vec<FileDeclaration>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What a watcher observes and which plugins consume it.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    #[serde(default)]
    pub name: String,

    /// Directory relative to the project root.
    #[serde(default)]
    pub dir: String,

    /// Extension filter (without the dot). Ignored when `files` is set.
    #[serde(default)]
    pub ext: String,

    /// Explicit files relative to `dir`.
    #[serde(default)]
    pub files: Vec<String>,

    /// File (relative to the root) whose content stands in for any change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Dispatch all matched files as one concatenated unit.
    #[serde(default)]
    pub group_all: bool,

    /// Plugin names, in dispatch order. Empty means pass-through.
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// A store entry assembled from other entries on every read.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct FileDeclaration {
    pub name: String,

    #[serde(default)]
    pub dir: String,

    #[serde(default)]
    pub ext: String,

    #[serde(default)]
    pub files: Vec<String>,

    /// Plugins the constituents are routed through.
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl FileDeclaration {
    pub fn merge_spec(&self) -> MergeSpec {
        MergeSpec {
            dir: self.dir.clone(),
            ext: self.ext.trim_start_matches('.').to_string(),
            files: self.files.clone(),
        }
    }

    /// The watcher feeding this entry's constituents into the store.
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            name: self.name.clone(),
            dir: self.dir.clone(),
            ext: self.ext.clone(),
            files: self.files.clone(),
            proxy: None,
            group_all: false,
            plugins: self.plugins.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidDefinition {
                name: self.dir.clone(),
                reason: "a name is required".to_string(),
            });
        }
        if self.ext.is_empty() && self.files.is_empty() {
            return Err(ConfigError::InvalidDefinition {
                name: self.name.clone(),
                reason: "either \"ext\" or \"files\" is required".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for all modules.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `"devcaddy::plugin": "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: None,
            debounce_ms: default_debounce_ms(),
            plugins: Vec::new(),
            watch: Vec::new(),
            files: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from the nearest `devcaddy.json`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::find_config().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from(CONFIG_FILE_NAME),
        })?;
        Self::load_from(path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let mut settings: Settings = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            // Double underscore separates nested levels
            .merge(Env::prefixed("DEVCADDY_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        settings.root = Some(match settings.root.take() {
            Some(root) if root.is_absolute() => root,
            Some(root) => base.join(root),
            None => base,
        });

        settings.validate()?;
        Ok(settings)
    }

    /// Search from the current directory up for `devcaddy.json`.
    pub fn find_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        current
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Root as configured, or the current directory.
    pub fn root(&self) -> Result<PathBuf, ConfigError> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().map_err(|e| ConfigError::Root {
                reason: e.to_string(),
            }),
        }
    }

    /// Every watcher the server runs: one per declared file, then the
    /// explicit watch list.
    pub fn watchers(&self) -> Vec<WatchConfig> {
        self.files
            .iter()
            .map(FileDeclaration::watch_config)
            .chain(self.watch.iter().cloned())
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for declaration in &self.files {
            declaration.validate()?;
        }
        Ok(())
    }

    /// Save current configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Write a starter `devcaddy.json` in the current directory.
    pub fn init_config_file(force: bool) -> Result<PathBuf, ConfigError> {
        let path = PathBuf::from(CONFIG_FILE_NAME);
        if !force && path.exists() {
            return Err(ConfigError::AlreadyExists { path });
        }

        Self::starter().save(&path)?;
        Ok(path)
    }

    /// A small working configuration: JavaScript bundled from `app/`,
    /// templates piped through a compiler into the transpiler.
    pub fn starter() -> Self {
        Self {
            plugins: vec![
                PluginConfig {
                    name: "transpile-js".to_string(),
                    path: Some(PathBuf::from("plugins/transpile.js")),
                    ..PluginConfig::default()
                },
                PluginConfig {
                    name: "template".to_string(),
                    path: Some(PathBuf::from("plugins/template.js")),
                    pipe_to: Some("transpile-js".to_string()),
                    ..PluginConfig::default()
                },
            ],
            watch: vec![WatchConfig {
                dir: "app/templates".to_string(),
                ext: "hbs".to_string(),
                plugins: vec!["template".to_string()],
                ..WatchConfig::default()
            }],
            files: vec![
                FileDeclaration {
                    name: "app.js".to_string(),
                    dir: "app".to_string(),
                    ext: "js".to_string(),
                    files: Vec::new(),
                    plugins: vec!["transpile-js".to_string()],
                },
                FileDeclaration {
                    name: "index.html".to_string(),
                    dir: "app".to_string(),
                    ext: String::new(),
                    files: vec!["index.html".to_string()],
                    plugins: Vec::new(),
                },
            ],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
{
    "root": "site",
    "plugins": [
        { "name": "transpile-js", "command": "echo", "args": "-n {{fileContent}}1" },
        { "name": "template", "command": "echo", "args": "-n {{fileContent}}2", "pipeTo": "transpile-js" },
        { "name": "lint", "command": "eslint", "logOnly": true }
    ],
    "watch": [
        { "dir": "app/templates", "ext": "hbs", "plugins": ["template"] },
        { "name": "styles", "dir": "app/styles", "ext": "scss", "proxy": "app/styles/app.scss", "groupAll": false }
    ],
    "files": [
        { "name": "app.js", "dir": "app", "ext": "js", "plugins": ["transpile-js", "lint"] },
        { "name": "vendor.js", "dir": "vendor", "files": ["bar/index.js", "baz/main.js"] }
    ]
}
"#;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.debounce_ms, 10);
        assert!(settings.plugins.is_empty());
        assert_eq!(settings.logging.default, "info");
    }

    #[test]
    fn test_load_from_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, CONFIG).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();

        assert_eq!(settings.root, Some(temp_dir.path().join("site")));
        assert_eq!(settings.plugins.len(), 3);
        assert_eq!(settings.plugins[1].pipe_to.as_deref(), Some("transpile-js"));
        assert!(settings.plugins[2].log_only);
        assert_eq!(
            settings.watch[1].proxy.as_deref(),
            Some("app/styles/app.scss")
        );
        assert_eq!(settings.files[1].files, vec!["bar/index.js", "baz/main.js"]);
        assert_eq!(settings.debounce_ms, 10);
    }

    #[test]
    fn test_declared_files_become_watchers() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, CONFIG).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        let watchers = settings.watchers();

        assert_eq!(watchers.len(), 4);
        assert_eq!(watchers[0].name, "app.js");
        assert_eq!(watchers[0].plugins, vec!["transpile-js", "lint"]);
        assert_eq!(watchers[2].dir, "app/templates");
    }

    #[test]
    fn test_missing_root_defaults_to_config_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "{}").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.root, Some(temp_dir.path().to_path_buf()));
    }

    #[test]
    fn test_declaration_needs_ext_or_files() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, r#"{ "files": [ { "name": "app.js", "dir": "app" } ] }"#).unwrap();

        let err = Settings::load_from(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "{ \"plugins\": [ ").unwrap();

        let err = Settings::load_from(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = Settings::load_from(temp_dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_save_and_reload_starter() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);

        Settings::starter().save(&config_path).unwrap();
        let loaded = Settings::load_from(&config_path).unwrap();

        assert_eq!(loaded.plugins[1].name, "template");
        assert_eq!(loaded.plugins[1].pipe_to.as_deref(), Some("transpile-js"));
        assert_eq!(loaded.files[0].name, "app.js");
    }
}
