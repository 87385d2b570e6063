//! Plugin loader configuration.
//!
//! Loaded from the `[plugins]` table of the broker's TOML config. The plugin
//! directory can be overridden with `SWITCHBOARD_PLUGIN_DIR`.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::constants::DEFAULT_PLUGIN_ENTRY_SYMBOL;
use crate::constants::DEFAULT_PLUGIN_FILE_PREFIX;
use crate::constants::PLUGIN_DIR_ENV;
use crate::error::ConfigError;

/// Where and how to discover plugin modules.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    /// Directory scanned (non-recursively) at startup. `None` disables loading.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    /// Required file-name prefix for candidates.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Entry-point symbol looked up in each candidate.
    #[serde(default = "default_entry_symbol")]
    pub entry_symbol: String,
}

fn default_file_prefix() -> String {
    DEFAULT_PLUGIN_FILE_PREFIX.to_string()
}

fn default_entry_symbol() -> String {
    DEFAULT_PLUGIN_ENTRY_SYMBOL.to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            file_prefix: default_file_prefix(),
            entry_symbol: default_entry_symbol(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    plugins: PluginConfig,
}

impl PluginConfig {
    /// Parse the `[plugins]` table out of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.plugins)
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `SWITCHBOARD_PLUGIN_DIR` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var_os(key))
    }

    /// Apply environment overrides using `lookup` instead of the real
    /// environment.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<std::ffi::OsString>,
    {
        if let Some(dir) = lookup(PLUGIN_DIR_ENV).filter(|d| !d.is_empty()) {
            tracing::debug!(dir = ?dir, "plugin directory overridden from environment");
            self.plugin_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Whether `file_name` names a loadable plugin module on this platform.
    pub fn is_candidate(&self, file_name: &str) -> bool {
        let suffix = std::env::consts::DLL_SUFFIX;
        file_name.starts_with(self.file_prefix.as_str())
            && file_name.len() > self.file_prefix.len() + suffix.len()
            && file_name.ends_with(suffix)
    }
}
