//! Abstract connection halves for the relay.
//!
//! A transport hands the relay one [`Connection`]: a reader half polled by
//! the handler's read loop and a writer half owned by the connection's
//! outbound drain task. WebSocket and in-memory transports both satisfy
//! these traits.

use crate::error::RelayResult;
use crate::frame::{CloseReason, Frame};
use std::future::Future;
use std::pin::Pin;

/// Receiving half of a duplex connection.
pub trait FrameReader: Send {
    /// Wait for the next application frame.
    ///
    /// Returns `Ok(None)` once the remote side has closed the connection.
    fn receive(&mut self) -> Pin<Box<dyn Future<Output = RelayResult<Option<Frame>>> + Send + '_>>;
}

/// Sending half of a duplex connection.
pub trait FrameWriter: Send {
    /// Write one frame to the remote side.
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>>;

    /// Send a close frame carrying `reason` and release the transport.
    fn close(&mut self, reason: CloseReason)
        -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>>;
}

/// An accepted connection, exclusively owned by the handler serving it.
pub struct Connection {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    /// Remote address or other label for logging.
    pub remote: String,
}

impl Connection {
    pub fn new(
        reader: impl FrameReader + 'static,
        writer: impl FrameWriter + 'static,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote: remote.into(),
        }
    }

    /// Close the connection without ever reading from it.
    pub async fn reject(self, reason: CloseReason) -> RelayResult<()> {
        let Connection { mut writer, .. } = self;
        writer.close(reason).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
