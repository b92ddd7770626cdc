//! peerline: chat client for the peerline relay.
//!
//! Connects to a relay under your own user id and exchanges messages with
//! one peer in real time.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use tracing::error;

/// peerline: relay chat client
#[derive(Parser)]
#[command(name = "peerline", version, about = "Chat with a peer through a peerline relay")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open an interactive chat with a peer
    Chat {
        /// Your own user id
        #[arg(short, long)]
        user: Option<String>,

        /// The peer's user id
        #[arg(short = 'P', long)]
        peer: String,

        /// Relay URL (ws:// or wss://)
        #[arg(short, long)]
        server: Option<String>,

        /// Relay endpoint path
        #[arg(long)]
        path: Option<String>,
    },
}

/// Log directive for this binary's own target.
fn log_filter(verbose: bool) -> &'static str {
    if verbose {
        "peerline=debug"
    } else {
        "peerline=warn"
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_target(cli.verbose)
        .init();

    // Load config file.
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::Config::default_path().to_string_lossy().to_string());
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("peerline: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Chat {
            user,
            peer,
            server,
            path,
        } => {
            // CLI flags override the config file.
            let user = user.unwrap_or(cfg.default.user);
            if user.is_empty() {
                eprintln!("peerline: no user id (pass --user or set default.user in {config_path})");
                std::process::exit(1);
            }
            let server = server.unwrap_or(cfg.default.server);
            let path = path.unwrap_or(cfg.default.path);
            commands::chat::run(&server, &path, &user, &peer).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("peerline: {e:#}");
        std::process::exit(1);
    }
}
