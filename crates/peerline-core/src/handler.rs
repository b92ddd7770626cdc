//! Per-connection relay handler.
//!
//! Each accepted connection gets one [`RelayHandler`]. The handler registers
//! its connection, reads frames in a loop and forwards each one to whatever
//! connection is currently registered under the peer id. Writes to a
//! connection happen only in that connection's own drain task, fed by a
//! bounded outbound queue, so a slow peer never stalls the sender's reads.
//!
//! ```text
//! Connecting ──register──▶ Active ──close/error/evict/shutdown──▶ Closing ──▶ Closed
//!      └──────────────rejected (duplicate id)───────────────────────────────▶ Closed
//! ```

use crate::error::{RelayError, RelayResult};
use crate::frame::{CloseReason, Frame};
use crate::params::ConnectParams;
use crate::registry::{ConnectionHandle, ConnectionRegistry, ConnectionToken, ReplacePolicy};
use crate::transport::{Connection, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default time allowed for a connection's transport to finish closing.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables shared by every handler of a service.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Frames that may wait for delivery to one connection before further
    /// frames to it are dropped.
    pub outbound_queue: usize,
    /// Behaviour when a participant id is already registered.
    pub on_duplicate: ReplacePolicy,
    /// Upper bound on waiting for the transport to close.
    pub close_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            on_duplicate: ReplacePolicy::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// How a handler's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Refused before registration.
    Rejected,
    /// The client closed the connection.
    PeerClosed,
    /// Reading from the transport failed.
    ReadFailed,
    /// A newer connection took over the participant id.
    Superseded,
    /// The service shut down.
    Shutdown,
}

/// Removes the registry entry when dropped, on every exit path.
struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    user_id: String,
    token: ConnectionToken,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove_if_owner(&self.user_id, self.token);
    }
}

/// Serves a single connection from registration to close.
pub struct RelayHandler {
    params: ConnectParams,
    registry: Arc<ConnectionRegistry>,
    options: RelayOptions,
    shutdown: CancellationToken,
    state: watch::Sender<HandlerState>,
}

impl RelayHandler {
    pub fn new(
        params: ConnectParams,
        registry: Arc<ConnectionRegistry>,
        options: RelayOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            params,
            registry,
            options,
            shutdown,
            state: watch::Sender::new(HandlerState::Connecting),
        }
    }

    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    /// Follow the handler's state while [`run`](Self::run) drives it.
    pub fn subscribe_state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: HandlerState) {
        let prev = self.state.send_replace(next);
        trace!(user_id = %self.params.user_id(), from = ?prev, to = ?next, "handler state");
    }

    /// Run the connection to completion.
    pub async fn run(self, conn: Connection) -> HandlerOutcome {
        let Connection {
            mut reader,
            writer,
            remote,
        } = conn;
        let user_id = self.params.user_id().to_string();
        let peer_id = self.params.peer_id().to_string();

        let token = self.registry.issue_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.outbound_queue.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_outbound(writer, outbound_rx, close_rx, user_id.clone()));
        let handle = ConnectionHandle::new(token, outbound_tx);

        match self
            .registry
            .register_with_policy(&user_id, handle.clone(), self.options.on_duplicate)
        {
            Ok(Some(previous)) => {
                info!(user_id = %user_id, old_token = %previous.token(), new_token = %token, "closing superseded connection");
                previous.request_close();
            }
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %user_id, remote = %remote, error = %e, "connection refused");
                let _ = close_tx.send(e.close_reason().unwrap_or(CloseReason::Normal));
                drop(handle);
                self.await_drain(drain).await;
                self.transition(HandlerState::Closed);
                return HandlerOutcome::Rejected;
            }
        }

        let guard = RegistrationGuard {
            registry: self.registry.clone(),
            user_id: user_id.clone(),
            token,
        };
        self.transition(HandlerState::Active);
        info!(user_id = %user_id, peer_id = %peer_id, remote = %remote, %token, "user connected");

        let (outcome, reason) = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    break (HandlerOutcome::Shutdown, CloseReason::Shutdown);
                }

                _ = handle.close_requested() => {
                    break (HandlerOutcome::Superseded, CloseReason::Superseded);
                }

                received = reader.receive() => match received {
                    Ok(Some(frame)) => {
                        trace!(user_id = %user_id, peer_id = %peer_id, frame = ?frame, "received frame");
                        if let Err(e) = self.forward(frame) {
                            match e {
                                RelayError::PeerNotConnected(_) => {
                                    debug!(user_id = %user_id, peer_id = %peer_id, "peer not connected, frame dropped");
                                }
                                other => {
                                    warn!(user_id = %user_id, peer_id = %peer_id, error = %other, "forward to peer failed");
                                }
                            }
                        }
                    }
                    Ok(None) => break (HandlerOutcome::PeerClosed, CloseReason::Normal),
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "read failed");
                        break (HandlerOutcome::ReadFailed, CloseReason::Normal);
                    }
                },
            }
        };

        self.transition(HandlerState::Closing);
        // The reason must reach the drain task before the outbound queue closes.
        let _ = close_tx.send(reason);
        drop(guard);
        drop(handle);
        drop(reader);
        self.await_drain(drain).await;
        self.transition(HandlerState::Closed);

        info!(user_id = %user_id, outcome = ?outcome, "user disconnected");
        outcome
    }

    /// Hand one frame to the connection currently registered as the peer.
    fn forward(&self, frame: Frame) -> RelayResult<()> {
        let peer_id = self.params.peer_id();
        let peer = self
            .registry
            .lookup(peer_id)
            .ok_or_else(|| RelayError::PeerNotConnected(peer_id.to_string()))?;
        let (kind, len) = (frame.kind(), frame.len());
        peer.try_forward(frame)?;
        debug!(
            user_id = %self.params.user_id(),
            peer_id = %peer_id,
            kind,
            bytes = len,
            "forwarded frame"
        );
        Ok(())
    }

    async fn await_drain(&self, drain: JoinHandle<()>) {
        let abort = drain.abort_handle();
        match tokio::time::timeout(self.options.close_timeout, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(user_id = %self.params.user_id(), error = %e, "outbound task failed");
            }
            Err(_) => {
                warn!(user_id = %self.params.user_id(), "transport did not close in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Write queued frames to the transport until told to close, then close it.
///
/// Frames already queued when the close arrives are still written. A write
/// failure stops delivery; later forwards to this connection fail fast. The
/// transport is only closed once the handler has sent its close reason.
async fn drain_outbound(
    mut writer: Box<dyn FrameWriter>,
    mut outbound: mpsc::Receiver<Frame>,
    mut close: oneshot::Receiver<CloseReason>,
    user_id: String,
) {
    let mut healthy = true;
    let reason = loop {
        tokio::select! {
            biased;

            reason = &mut close => break reason.unwrap_or(CloseReason::Normal),

            next = outbound.recv(), if healthy => match next {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        warn!(user_id = %user_id, error = %e, "write to connection failed");
                        healthy = false;
                        outbound.close();
                    }
                }
                None => break (&mut close).await.unwrap_or(CloseReason::Normal),
            },
        }
    };

    outbound.close();
    if healthy {
        while let Ok(frame) = outbound.try_recv() {
            if let Err(e) = writer.send(frame).await {
                debug!(user_id = %user_id, error = %e, "flush before close failed");
                break;
            }
        }
    }

    if let Err(e) = writer.close(reason).await {
        debug!(user_id = %user_id, error = %e, "transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, MemoryEvent};
    use std::future::Future;
    use std::pin::Pin;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn_handler(
        registry: &Arc<ConnectionRegistry>,
        options: RelayOptions,
        shutdown: &CancellationToken,
        user: &str,
        peer: &str,
        conn: Connection,
    ) -> JoinHandle<HandlerOutcome> {
        let handler = RelayHandler::new(
            ConnectParams::new(user, peer).unwrap(),
            registry.clone(),
            options,
            shutdown.clone(),
        );
        tokio::spawn(handler.run(conn))
    }

    async fn wait_for(registry: &ConnectionRegistry, id: &str) {
        tokio::time::timeout(WAIT, async {
            while !registry.contains(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("participant never registered");
    }

    /// Writer whose sends never complete.
    struct StalledWriter;

    impl FrameWriter for StalledWriter {
        fn send(&mut self, _frame: Frame) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
            Box::pin(std::future::pending())
        }

        fn close(
            &mut self,
            _reason: CloseReason,
        ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Writer whose sends always fail, as after a reset socket.
    struct FailingWriter;

    impl FrameWriter for FailingWriter {
        fn send(&mut self, _frame: Frame) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
            Box::pin(async { Err(RelayError::Transport("broken pipe".into())) })
        }

        fn close(
            &mut self,
            _reason: CloseReason,
        ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn state_follows_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = RelayHandler::new(
            ConnectParams::new("A", "B").unwrap(),
            registry.clone(),
            RelayOptions::default(),
            CancellationToken::new(),
        );
        assert_eq!(handler.state(), HandlerState::Connecting);
        let mut state = handler.subscribe_state();

        let (conn, mut client) = memory::pair("a");
        let task = tokio::spawn(handler.run(conn));

        tokio::time::timeout(WAIT, state.wait_for(|s| *s == HandlerState::Active))
            .await
            .expect("handler never became active")
            .unwrap();
        assert!(registry.contains("A"));

        client.close();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == HandlerState::Closed))
            .await
            .expect("handler never closed")
            .unwrap();
        assert_eq!(task.await.unwrap(), HandlerOutcome::PeerClosed);
        assert!(!registry.contains("A"));
    }

    #[tokio::test]
    async fn rejected_handler_goes_straight_to_closed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let options = RelayOptions {
            on_duplicate: ReplacePolicy::Reject,
            ..RelayOptions::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        registry.register("A", ConnectionHandle::new(registry.issue_token(), tx));

        let handler = RelayHandler::new(
            ConnectParams::new("A", "B").unwrap(),
            registry.clone(),
            options,
            CancellationToken::new(),
        );
        let state = handler.subscribe_state();
        let (conn, _client) = memory::pair("a");

        assert_eq!(handler.run(conn).await, HandlerOutcome::Rejected);
        assert_eq!(*state.borrow(), HandlerState::Closed);
    }

    #[tokio::test]
    async fn failed_peer_write_leaves_sender_running() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();

        let (conn_b, mut b) = memory::pair("b");
        let conn_b = Connection {
            writer: Box::new(FailingWriter),
            ..conn_b
        };
        let task_b = spawn_handler(&registry, RelayOptions::default(), &shutdown, "B", "A", conn_b);
        wait_for(&registry, "B").await;
        let (conn_a, mut a) = memory::pair("a");
        let task_a = spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_a);
        wait_for(&registry, "A").await;

        assert!(a.send("first"));
        let peer = registry.lookup("B").unwrap();
        tokio::time::timeout(WAIT, async {
            while !peer.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("failed write never closed the peer queue");

        let err = peer.try_forward(Frame::from("again")).unwrap_err();
        assert!(matches!(err, RelayError::ForwardWrite(ref m) if m == "connection is closing"));

        for i in 0..10 {
            assert!(a.send(format!("after-{i}")));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task_a.is_finished());
        assert!(a.try_recv().is_none());
        assert!(registry.contains("B"));

        b.close();
        assert_eq!(task_b.await.unwrap(), HandlerOutcome::PeerClosed);
        assert!(!registry.contains("B"));
        assert!(registry.contains("A"));
    }

    #[tokio::test]
    async fn drain_keeps_reason_when_queue_closes_first() {
        let (conn, mut client) = memory::pair("a");
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (close_tx, close_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_outbound(conn.writer, outbound_rx, close_rx, "A".into()));

        outbound_tx.send(Frame::from("last")).await.unwrap();
        drop(outbound_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        close_tx.send(CloseReason::Shutdown).unwrap();
        drain.await.unwrap();
        assert_eq!(client.recv().await, Some(MemoryEvent::Frame(Frame::from("last"))));
        assert_eq!(client.recv().await, Some(MemoryEvent::Closed(CloseReason::Shutdown)));
    }

    #[tokio::test]
    async fn forwards_in_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (conn_a, a) = memory::pair("a");
        let (conn_b, mut b) = memory::pair("b");
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_a);
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "B", "A", conn_b);
        wait_for(&registry, "A").await;
        wait_for(&registry, "B").await;

        for i in 0..50 {
            assert!(a.send(format!("msg-{i}")));
        }
        for i in 0..50 {
            assert_eq!(
                b.recv_timeout(WAIT).await,
                Some(MemoryEvent::Frame(Frame::Text(format!("msg-{i}"))))
            );
        }
    }

    #[tokio::test]
    async fn binary_frames_are_forwarded_unchanged() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (conn_a, a) = memory::pair("a");
        let (conn_b, mut b) = memory::pair("b");
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_a);
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "B", "A", conn_b);
        wait_for(&registry, "A").await;
        wait_for(&registry, "B").await;

        let payload = vec![0u8, 159, 146, 150, 255];
        a.send(payload.clone());
        assert_eq!(b.recv_timeout(WAIT).await, Some(MemoryEvent::Frame(Frame::Binary(payload))));
    }

    #[tokio::test]
    async fn read_error_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (conn_a, mut a) = memory::pair("a");
        let task = spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_a);
        wait_for(&registry, "A").await;

        a.fail("connection reset");
        assert_eq!(task.await.unwrap(), HandlerOutcome::ReadFailed);
        assert!(registry.lookup("A").is_none());
        assert_eq!(a.recv_timeout(WAIT).await, Some(MemoryEvent::Closed(CloseReason::Normal)));
    }

    #[tokio::test]
    async fn stalled_peer_does_not_block_sender() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let options = RelayOptions {
            outbound_queue: 2,
            close_timeout: Duration::from_millis(100),
            ..RelayOptions::default()
        };

        let (conn_b, _b) = memory::pair("b");
        let conn_b = Connection {
            writer: Box::new(StalledWriter),
            ..conn_b
        };
        spawn_handler(&registry, options.clone(), &shutdown, "B", "A", conn_b);
        wait_for(&registry, "B").await;

        let (conn_a, mut a) = memory::pair("a");
        let task_a = spawn_handler(&registry, options, &shutdown, "A", "B", conn_a);
        wait_for(&registry, "A").await;

        for i in 0..20 {
            assert!(a.send(format!("flood-{i}")));
        }
        a.close();

        let outcome = tokio::time::timeout(WAIT, task_a)
            .await
            .expect("sender blocked by stalled peer")
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::PeerClosed);
        assert_eq!(a.recv_timeout(WAIT).await, Some(MemoryEvent::Closed(CloseReason::Normal)));
        assert!(registry.contains("B"));
    }

    #[tokio::test]
    async fn replaced_connection_is_closed_and_keeps_new_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (conn_old, mut old) = memory::pair("old");
        let old_task = spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_old);
        wait_for(&registry, "A").await;
        let old_token = registry.lookup("A").unwrap().token();

        let (conn_new, mut new) = memory::pair("new");
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_new);

        assert_eq!(old_task.await.unwrap(), HandlerOutcome::Superseded);
        assert_eq!(
            old.recv_timeout(WAIT).await,
            Some(MemoryEvent::Closed(CloseReason::Superseded))
        );
        let current = registry.lookup("A").expect("new connection must stay registered");
        assert_ne!(current.token(), old_token);

        let (conn_b, b) = memory::pair("b");
        spawn_handler(&registry, RelayOptions::default(), &shutdown, "B", "A", conn_b);
        wait_for(&registry, "B").await;
        b.send("to the new one");
        assert_eq!(
            new.recv_timeout(WAIT).await,
            Some(MemoryEvent::Frame(Frame::from("to the new one")))
        );
    }

    #[tokio::test]
    async fn reject_policy_refuses_duplicate() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let options = RelayOptions {
            on_duplicate: ReplacePolicy::Reject,
            ..RelayOptions::default()
        };
        let (conn_first, mut first) = memory::pair("first");
        spawn_handler(&registry, options.clone(), &shutdown, "A", "B", conn_first);
        wait_for(&registry, "A").await;
        let token = registry.lookup("A").unwrap().token();

        let (conn_second, mut second) = memory::pair("second");
        let task = spawn_handler(&registry, options, &shutdown, "A", "B", conn_second);
        assert_eq!(task.await.unwrap(), HandlerOutcome::Rejected);
        assert_eq!(
            second.recv_timeout(WAIT).await,
            Some(MemoryEvent::Closed(CloseReason::AlreadyConnected))
        );
        assert_eq!(registry.lookup("A").unwrap().token(), token);
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_active_handler() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let (conn_a, mut a) = memory::pair("a");
        let task = spawn_handler(&registry, RelayOptions::default(), &shutdown, "A", "B", conn_a);
        wait_for(&registry, "A").await;

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), HandlerOutcome::Shutdown);
        assert_eq!(a.recv_timeout(WAIT).await, Some(MemoryEvent::Closed(CloseReason::Shutdown)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn guard_deregisters_on_panic() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(registry.issue_token(), tx);
        let token = handle.token();
        registry.register("A", handle);

        let task_registry = registry.clone();
        let result = tokio::spawn(async move {
            let _guard = RegistrationGuard {
                registry: task_registry,
                user_id: "A".into(),
                token,
            };
            panic!("handler bug");
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert!(registry.lookup("A").is_none());
    }

    #[tokio::test]
    async fn queued_frames_flush_before_close() {
        let (conn, mut client) = memory::pair("a");
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, close_rx) = oneshot::channel();
        tx.send(Frame::from("one")).await.unwrap();
        tx.send(Frame::from("two")).await.unwrap();
        close_tx.send(CloseReason::Shutdown).unwrap();

        drain_outbound(conn.writer, rx, close_rx, "A".into()).await;

        assert_eq!(client.recv().await, Some(MemoryEvent::Frame(Frame::from("one"))));
        assert_eq!(client.recv().await, Some(MemoryEvent::Frame(Frame::from("two"))));
        assert_eq!(client.recv().await, Some(MemoryEvent::Closed(CloseReason::Shutdown)));
    }
}
