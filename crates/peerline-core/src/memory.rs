//! In-memory transport.
//!
//! [`pair`] returns a relay-side [`Connection`] and the [`MemoryClient`]
//! that plays the remote participant. Used to drive the relay without
//! sockets.

use crate::error::{RelayError, RelayResult};
use crate::frame::{CloseReason, Frame};
use crate::transport::{Connection, FrameReader, FrameWriter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the client side observes from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Frame(Frame),
    Closed(CloseReason),
}

enum Inbound {
    Frame(Frame),
    Fail(String),
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl FrameReader for MemoryReader {
    fn receive(&mut self) -> Pin<Box<dyn Future<Output = RelayResult<Option<Frame>>> + Send + '_>> {
        Box::pin(async move {
            match self.inbound.recv().await {
                Some(Inbound::Frame(frame)) => Ok(Some(frame)),
                Some(Inbound::Fail(error)) => Err(RelayError::Read(error)),
                None => Ok(None),
            }
        })
    }
}

struct MemoryWriter {
    outbound: mpsc::UnboundedSender<MemoryEvent>,
    closed: bool,
}

impl FrameWriter for MemoryWriter {
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(RelayError::TransportClosed);
            }
            self.outbound
                .send(MemoryEvent::Frame(frame))
                .map_err(|_| RelayError::Transport("memory client dropped".into()))
        })
    }

    fn close(
        &mut self,
        reason: CloseReason,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                let _ = self.outbound.send(MemoryEvent::Closed(reason));
            }
            Ok(())
        })
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryClient {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<MemoryEvent>,
}

impl MemoryClient {
    /// Send a frame to the relay. Returns `false` once the relay stopped reading.
    pub fn send(&self, frame: impl Into<Frame>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Frame(frame.into())).is_ok())
    }

    /// Make the relay's next read fail with `error`.
    pub fn fail(&self, error: impl Into<String>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Inbound::Fail(error.into()));
        }
    }

    /// Close the client side; the relay observes end-of-stream.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next event from the relay.
    pub async fn recv(&mut self) -> Option<MemoryEvent> {
        self.outbound.recv().await
    }

    /// Wait at most `limit` for the next event.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<MemoryEvent> {
        tokio::time::timeout(limit, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take an already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<MemoryEvent> {
        self.outbound.try_recv().ok()
    }
}

/// Create a connected relay/client pair.
pub fn pair(remote: impl Into<String>) -> (Connection, MemoryClient) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connection = Connection::new(
        MemoryReader {
            inbound: inbound_rx,
        },
        MemoryWriter {
            outbound: outbound_tx,
            closed: false,
        },
        remote,
    );
    let client = MemoryClient {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
    };
    (connection, client)
}
