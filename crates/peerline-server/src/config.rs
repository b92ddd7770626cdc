//! Server configuration: TOML file + CLI overrides.

use peerline_core::{RelayError, RelayOptions, RelayResult, ReplacePolicy};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default)]
    pub on_duplicate: ReplacePolicy,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            on_duplicate: ReplacePolicy::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/sendMessage".to_string()
}
fn default_max_frame_size() -> usize {
    1_048_576
}
fn default_outbound_queue() -> usize {
    peerline_core::handler::DEFAULT_OUTBOUND_QUEUE
}
fn default_shutdown_grace() -> u64 {
    5
}

/// Values given on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub outbound_queue: Option<usize>,
    pub on_duplicate: Option<ReplacePolicy>,
}

/// Resolved server configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub path: String,
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub on_duplicate: ReplacePolicy,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; a file that does not parse is an error.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, overrides: &CliOverrides) -> Self {
        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            path: overrides.path.clone().unwrap_or(file.server.path),
            max_frame_size: file.server.max_frame_size,
            outbound_queue: overrides.outbound_queue.unwrap_or(file.relay.outbound_queue),
            on_duplicate: overrides.on_duplicate.unwrap_or(file.relay.on_duplicate),
            shutdown_grace: Duration::from_secs(file.relay.shutdown_grace_secs),
        }
    }

    fn validate(&self) -> RelayResult<()> {
        if self.outbound_queue == 0 {
            return Err(RelayError::Config("outbound_queue must be at least 1".into()));
        }
        if !self.path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.max_frame_size == 0 {
            return Err(RelayError::Config("max_frame_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Address the WebSocket listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Handler tunables derived from this config.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            outbound_queue: self.outbound_queue,
            on_duplicate: self.on_duplicate,
            ..RelayOptions::default()
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
