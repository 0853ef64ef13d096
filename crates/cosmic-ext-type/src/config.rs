use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use type_input::Timing;

/// Default config directory under `$XDG_CONFIG_HOME`.
const CONFIG_DIR: &str = "cosmic-ext-type";
/// Default config file name.
const CONFIG_FILE: &str = "config.toml";

/// Typing defaults loaded from TOML. Command-line flags override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeConfig {
    /// Do not flush the connection after each key press/release.
    pub no_flush: bool,

    /// Delay between characters, in milliseconds.
    pub key_delay_ms: u64,

    /// How long each key is held down, in milliseconds.
    pub key_hold_ms: u64,

    /// How long to wait for the compositor to offer a keyboard with a
    /// keymap before giving up, in milliseconds.
    pub ready_timeout_ms: u64,

    /// Client name announced to the compositor.
    pub app_name: String,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            no_flush: false,
            key_delay_ms: 0,
            key_hold_ms: 0,
            ready_timeout_ms: 1000,
            app_name: "cosmic-ext-type".to_string(),
        }
    }
}

impl TypeConfig {
    #[must_use]
    pub fn timing(&self) -> Timing {
        Timing {
            no_flush: self.no_flush,
            key_delay: Duration::from_millis(self.key_delay_ms),
            key_hold: Duration::from_millis(self.key_hold_ms),
        }
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Resolve the default config file path.
///
/// Returns `$XDG_CONFIG_HOME/cosmic-ext-type/config.toml` or
/// `~/.config/cosmic-ext-type/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(CONFIG_DIR)
        .join(CONFIG_FILE)
}

/// Load the configuration from a TOML file.
///
/// If `path` is `None`, reads from the default location.
/// Returns the default configuration if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: Option<&Path>) -> Result<TypeConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path(),
    };

    if !path.exists() {
        tracing::debug!(?path, "Config file not found, using defaults");
        return Ok(TypeConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;

    let config: TypeConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;

    tracing::debug!(?path, "Configuration loaded");
    Ok(config)
}
