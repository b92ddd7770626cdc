//! Client configuration at `~/.peerline/client.toml`.
//!
//! Provides the default relay URL, endpoint path and user id.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Relay base URL (`ws://` or `wss://`).
    #[serde(default = "default_server")]
    pub server: String,

    /// Relay endpoint path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Own user id (empty = must be given on the command line).
    #[serde(default)]
    pub user: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            path: default_path(),
            user: String::new(),
        }
    }
}

fn default_server() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_path() -> String {
    "/sendMessage".to_string()
}

impl Config {
    /// Load config from `path`, falling back to defaults when it does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "no client config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Default location: `~/.peerline/client.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".peerline")
            .join("client.toml")
    }
}

fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
