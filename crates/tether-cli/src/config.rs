//! CLI configuration at `~/.tether/config.toml`.
//!
//! Holds the default gateway endpoints, secret and proxy. CLI flags and
//! environment variables always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Client WebSocket endpoint of the gateway.
    #[serde(default = "default_gateway")]
    pub gateway: String,

    /// Backend WebSocket endpoint, used by `tether serve`.
    #[serde(default = "default_backend_gateway")]
    pub backend_gateway: String,

    #[serde(default)]
    pub secret: Option<String>,

    /// `socks5://[user:pass@]host[:port]`
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            gateway: default_gateway(),
            backend_gateway: default_backend_gateway(),
            secret: None,
            proxy: None,
        }
    }
}

fn default_gateway() -> String {
    "ws://127.0.0.1:7401".to_string()
}

fn default_backend_gateway() -> String {
    "ws://127.0.0.1:7400".to_string()
}

/// `~/.tether/config.toml`, or a relative fallback without a home directory.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".tether")
        .join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
