//! Relay service: the composition root for accepted connections.
//!
//! Owns the shared registry, the shutdown token and the set of running
//! handler tasks. Transports hand every accepted connection to
//! [`RelayService::accept`].

use crate::frame::CloseReason;
use crate::handler::{HandlerOutcome, RelayHandler, RelayOptions};
use crate::params::{ConnectParams, MISSING_PARAMETER_REASON};
use crate::registry::ConnectionRegistry;
use crate::transport::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Accepts connections and runs one [`RelayHandler`] per connection.
#[derive(Clone)]
pub struct RelayService {
    registry: Arc<ConnectionRegistry>,
    options: RelayOptions,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RelayService {
    /// Create a new service around an existing registry.
    pub fn new(registry: Arc<ConnectionRegistry>, options: RelayOptions) -> Self {
        Self {
            registry,
            options,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The registry shared by all handlers of this service.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Accept a connection whose identifiers are still in the raw query string.
    ///
    /// Returns the handle of the task serving the connection. A connection
    /// with a missing `user_id` or `peer_id` is closed with a reason and
    /// never registered.
    pub fn accept(&self, conn: Connection, query: Option<&str>) -> JoinHandle<HandlerOutcome> {
        match ConnectParams::from_query(query) {
            Ok(params) => self.accept_params(conn, params),
            Err(e) => {
                let reason = e
                    .close_reason()
                    .unwrap_or_else(|| CloseReason::MissingParameter(MISSING_PARAMETER_REASON.into()));
                self.reject(conn, reason)
            }
        }
    }

    /// Accept a connection with already-extracted identifiers.
    pub fn accept_params(&self, conn: Connection, params: ConnectParams) -> JoinHandle<HandlerOutcome> {
        if self.is_shutting_down() {
            return self.reject(conn, CloseReason::Shutdown);
        }

        debug!(
            user_id = %params.user_id(),
            peer_id = %params.peer_id(),
            remote = %conn.remote,
            "accepting connection"
        );
        let handler = RelayHandler::new(
            params,
            self.registry.clone(),
            self.options.clone(),
            self.shutdown.clone(),
        );
        self.tasks.spawn(handler.run(conn))
    }

    fn reject(&self, conn: Connection, reason: CloseReason) -> JoinHandle<HandlerOutcome> {
        let close_timeout = self.options.close_timeout;
        self.tasks.spawn(async move {
            let remote = conn.remote.clone();
            warn!(remote = %remote, reason = %reason, "rejecting connection");
            match tokio::time::timeout(close_timeout, conn.reject(reason)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(remote = %remote, error = %e, "close after rejection failed"),
                Err(_) => debug!(remote = %remote, "close after rejection timed out"),
            }
            HandlerOutcome::Rejected
        })
    }

    /// Signal every handler to close its connection and refuse new ones.
    pub fn shutdown(&self) {
        info!(connections = self.registry.len(), "relay shutting down");
        self.shutdown.cancel();
        self.tasks.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of connection tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every connection task has finished, up to `limit`.
    ///
    /// Only completes after [`shutdown`](Self::shutdown). Returns `false` on
    /// timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.tasks.wait()).await.is_ok()
    }
}
