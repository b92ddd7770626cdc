//! Core server: binds the WebSocket listener and hands every accepted
//! connection to the relay service.
//!
//! Owns the relay service (and through it the connection registry) and
//! coordinates shutdown: stop accepting, close every live connection, wait
//! for the handlers to drain.

use crate::config::ServerConfig;
use crate::transport::websocket::{self, AcceptedConnection, ListenerSettings};
use peerline_core::{ConnectionRegistry, RelayResult, RelayService};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The peerline relay server instance.
pub struct RelayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Relay service shared with every connection task.
    service: RelayService,
    /// Address the listener actually bound (resolves port 0).
    local_addr: SocketAddr,
    /// Upgraded connections from the WebSocket listener.
    incoming: mpsc::Receiver<AcceptedConnection>,
}

impl RelayServer {
    /// Bind the listener and build the relay service.
    pub async fn bind(config: ServerConfig) -> RelayResult<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let service = RelayService::new(registry, config.relay_options());

        let settings = ListenerSettings {
            path: config.path.clone(),
            max_frame_size: config.max_frame_size,
        };
        let (local_addr, incoming) = websocket::start_listener(config.listen_addr(), settings).await?;

        Ok(Self {
            config,
            service,
            local_addr,
            incoming,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Access the relay service.
    pub fn service(&self) -> &RelayService {
        &self.service
    }

    /// Accept connections until `shutdown` resolves or the listener stops,
    /// then close every connection and wait for the handlers to finish.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RelayResult<()> {
        let RelayServer {
            config,
            service,
            local_addr,
            mut incoming,
        } = self;

        info!(
            addr = %local_addr,
            path = %config.path,
            on_duplicate = ?config.on_duplicate,
            outbound_queue = config.outbound_queue,
            "peerline-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = incoming.recv() => match accepted {
                    Some(accepted) => {
                        debug!(
                            remote = %accepted.remote_addr,
                            connections = service.registry().len(),
                            "dispatching connection"
                        );
                        service.accept(accepted.connection, accepted.query.as_deref());
                    }
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        // Stop the listener before closing the live connections.
        drop(incoming);
        service.shutdown();
        if service.wait_idle(config.shutdown_grace).await {
            info!("all connections closed");
        } else {
            warn!(
                remaining = service.active_tasks(),
                "connections still open after shutdown grace period"
            );
        }

        Ok(())
    }
}
