//! Registry configuration.
//!
//! Built from defaults, an optional TOML file and `UDFHOST_*` environment
//! overrides, in that order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UdfError};

/// Identifier length limit, in characters.
pub const DEFAULT_MAX_NAME_CHARS: usize = 64;

/// Environment variable names.
pub mod env_vars {
    pub const PLUGIN_DIR: &str = "UDFHOST_PLUGIN_DIR";
    pub const ALLOW_SUSPICIOUS_BINDINGS: &str = "UDFHOST_ALLOW_SUSPICIOUS_UDFS";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdfConfig {
    /// Directory every library path is resolved against.
    pub plugin_dir: PathBuf,
    /// Bind functions that export neither `_init` nor `_deinit`, with a
    /// warning, instead of refusing them.
    pub allow_suspicious_bindings: bool,
    pub max_name_chars: usize,
}

impl Default for UdfConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            allow_suspicious_bindings: false,
            max_name_chars: DEFAULT_MAX_NAME_CHARS,
        }
    }
}

impl UdfConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| UdfError::config(format!("invalid config: {}", e)))
    }

    /// Read a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| UdfError::config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(env_vars::PLUGIN_DIR) {
            if !dir.is_empty() {
                self.plugin_dir = PathBuf::from(dir);
            }
        }
        if let Some(value) = lookup(env_vars::ALLOW_SUSPICIOUS_BINDINGS) {
            self.allow_suspicious_bindings = parse_bool(&value).ok_or_else(|| {
                UdfError::config(format!(
                    "{} must be a boolean, got '{}'",
                    env_vars::ALLOW_SUSPICIOUS_BINDINGS,
                    value
                ))
            })?;
        }
        Ok(())
    }
}

fn default_plugin_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("udfhost").join("plugins"))
        .unwrap_or_else(|| PathBuf::from("plugins"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
