//! Connection registry: participant id → live connection handle.
//!
//! The registry is the only shared mutable state in the relay. It stores
//! non-owning handles; closing a connection is always the job of the handler
//! that owns it.

use crate::error::{RelayError, RelayResult};
use crate::frame::Frame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Identity stamp of one accepted connection.
///
/// Compared on removal so that a handler which has been replaced cannot
/// evict the entry of the connection that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(u64);

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a participant id is registered while another live
/// connection already holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacePolicy {
    /// The newer connection wins; the older one is asked to close.
    #[default]
    Replace,
    /// The newer connection is refused.
    Reject,
}

impl FromStr for ReplacePolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(ReplacePolicy::Replace),
            "reject" => Ok(ReplacePolicy::Reject),
            other => Err(RelayError::Config(format!(
                "unknown duplicate policy '{other}' (expected replace or reject)"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ReplacePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// Non-owning reference to a registered connection.
///
/// Forwarding pushes onto the connection's bounded outbound queue; the
/// owning handler's drain task performs the actual write.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    token: ConnectionToken,
    outbound: mpsc::Sender<Frame>,
    eviction: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(token: ConnectionToken, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            token,
            outbound,
            eviction: Arc::new(Notify::new()),
        }
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    /// Queue a frame for delivery without waiting.
    ///
    /// Fails with [`RelayError::ForwardWrite`] when the queue is full or the
    /// connection is already shutting down.
    pub fn try_forward(&self, frame: Frame) -> RelayResult<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::ForwardWrite("outbound queue full".into()),
            TrySendError::Closed(_) => RelayError::ForwardWrite("connection is closing".into()),
        })
    }

    /// Ask the owning handler to close this connection.
    pub fn request_close(&self) {
        self.eviction.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn close_requested(&self) {
        self.eviction.notified().await;
    }

    /// Whether the connection's outbound side has already shut down.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Concurrent map of live connections keyed by participant id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: DashMap<String, ConnectionHandle>,
    next_token: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Issue a fresh token for a newly accepted connection.
    pub fn issue_token(&self) -> ConnectionToken {
        ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert or overwrite the entry for `id`.
    ///
    /// Returns the handle that was displaced, if any. The displaced
    /// connection is not closed.
    pub fn register(&self, id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let token = handle.token;
        let previous = self.entries.insert(id.to_string(), handle);
        info!(user_id = %id, %token, replaced = previous.is_some(), "connection registered");
        previous
    }

    /// Atomically register `handle` under `id` according to `policy`.
    ///
    /// With [`ReplacePolicy::Reject`] an existing live entry is left in place
    /// and [`RelayError::AlreadyConnected`] is returned. An entry whose
    /// connection has already shut down never blocks a new registration.
    pub fn register_with_policy(
        &self,
        id: &str,
        handle: ConnectionHandle,
        policy: ReplacePolicy,
    ) -> RelayResult<Option<ConnectionHandle>> {
        let token = handle.token;
        let previous = match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if policy == ReplacePolicy::Reject && !occupied.get().is_closed() {
                    return Err(RelayError::AlreadyConnected(id.to_string()));
                }
                Some(occupied.insert(handle))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                None
            }
        };
        info!(user_id = %id, %token, replaced = previous.is_some(), "connection registered");
        Ok(previous)
    }

    /// Look up the live connection registered under `id`.
    pub fn lookup(&self, id: &str) -> Option<ConnectionHandle> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `id` regardless of owner. Absent ids are a no-op.
    pub fn remove(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            debug!(user_id = %id, "connection unregistered");
        }
    }

    /// Remove the entry for `id` only if it still belongs to `token`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if_owner(&self, id: &str, token: ConnectionToken) -> bool {
        let removed = self
            .entries
            .remove_if(id, |_, handle| handle.token == token)
            .is_some();
        if removed {
            debug!(user_id = %id, %token, "connection unregistered");
        } else {
            debug!(user_id = %id, %token, "entry owned by another connection, left in place");
        }
        removed
    }

    /// Whether `id` currently has a registered connection.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Sorted list of registered participant ids.
    pub fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
