//! peerline-server: pairwise WebSocket relay.
//!
//! Accepts WebSocket connections carrying `user_id` and `peer_id` query
//! parameters and forwards every frame a participant sends to the
//! connection currently registered under its peer id.

mod config;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use peerline_core::ReplacePolicy;
use server::RelayServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// peerline-server: pairwise WebSocket relay
#[derive(Parser, Debug)]
#[command(name = "peerline-server", version, about = "Pairwise WebSocket message relay")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Request path of the relay endpoint
    #[arg(long)]
    path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.peerline/config.toml")]
    config: String,

    /// What to do when a user_id connects twice (replace or reject)
    #[arg(long)]
    on_duplicate: Option<ReplacePolicy>,

    /// Frames queued per connection before further frames to it are dropped
    #[arg(long)]
    outbound_queue: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting peerline-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        path: cli.path.clone(),
        outbound_queue: cli.outbound_queue,
        on_duplicate: cli.on_duplicate,
    };
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay_server = match RelayServer::bind(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    info!(addr = %relay_server.local_addr(), "listening");
    let registry = relay_server.service().registry().clone();

    if let Err(e) = relay_server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!(remaining = registry.len(), "peerline-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
