//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the configured
//! path and captures the request query string so the relay can read
//! `user_id` and `peer_id`. Each upgraded stream is split into the relay's
//! reader and writer halves.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerline_core::{CloseReason, Connection, Frame, FrameReader, FrameWriter, RelayError, RelayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<TcpStream>;

/// Listener settings that apply to every upgrade.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Request path the relay endpoint is served on.
    pub path: String,
    /// Largest accepted message, in bytes.
    pub max_frame_size: usize,
}

/// An upgraded WebSocket connection ready for the relay.
pub struct AcceptedConnection {
    pub connection: Connection,
    /// Raw query string of the upgrade request.
    pub query: Option<String>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. Dropping the receiver stops the listener.
pub async fn start_listener(
    bind_addr: SocketAddr,
    settings: ListenerSettings,
) -> RelayResult<(SocketAddr, mpsc::Receiver<AcceptedConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %settings.path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<AcceptedConnection>(64);
    let settings = Arc::new(settings);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("connection receiver dropped, listener stopping");
                    break;
                }
                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let tx = tx.clone();
                        let settings = settings.clone();
                        tokio::spawn(async move {
                            match upgrade(stream, addr, &settings).await {
                                Ok(conn) => {
                                    debug!(remote = %addr, "WebSocket connection accepted");
                                    if tx.send(conn).await.is_err() {
                                        warn!("WebSocket connection channel closed");
                                    }
                                }
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                },
            }
        }
    });

    Ok((local_addr, rx))
}

/// Perform the upgrade handshake, refusing any path but the relay endpoint.
async fn upgrade(
    stream: TcpStream,
    remote_addr: SocketAddr,
    settings: &ListenerSettings,
) -> RelayResult<AcceptedConnection> {
    let mut query: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != settings.path {
            let mut rejection = ErrorResponse::new(Some("unknown endpoint".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(settings.max_frame_size);
    ws_config.max_frame_size = Some(settings.max_frame_size);

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(|e| RelayError::Transport(format!("WS upgrade failed: {e}")))?;

    let (sink, stream) = ws_stream.split();
    let connection = Connection::new(
        WsReader { stream },
        WsWriter { sink },
        remote_addr.to_string(),
    );

    Ok(AcceptedConnection {
        connection,
        query,
        remote_addr,
    })
}

/// Receiving half of an upgraded WebSocket.
struct WsReader {
    stream: SplitStream<WsStream>,
}

impl FrameReader for WsReader {
    fn receive(&mut self) -> Pin<Box<dyn Future<Output = RelayResult<Option<Frame>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data))),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Ping/pong are answered by tungstenite and never relayed.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(RelayError::Read(format!("WS recv failed: {e}"))),
                    None => return Ok(None),
                }
            }
        })
    }
}

/// Sending half of an upgraded WebSocket.
struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl FrameWriter for WsWriter {
    fn send(&mut self, frame: Frame) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            };
            self.sink
                .send(message)
                .await
                .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(
        &mut self,
        reason: CloseReason,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>> {
        Box::pin(async move {
            let close_frame = close_frame(&reason);
            if let Err(e) = self.sink.send(Message::Close(close_frame)).await {
                debug!(error = %e, "WS close frame not sent");
            }
            self.sink
                .close()
                .await
                .map_err(|e| RelayError::Transport(format!("WS close failed: {e}")))
        })
    }
}

/// Map a relay close reason onto a WebSocket close frame.
fn close_frame(reason: &CloseReason) -> Option<CloseFrame<'static>> {
    let code = match reason {
        CloseReason::Normal => return None,
        CloseReason::Shutdown => CloseCode::Away,
        r if r.is_policy_violation() => CloseCode::Policy,
        _ => CloseCode::Normal,
    };
    Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes() {
        assert!(close_frame(&CloseReason::Normal).is_none());

        let missing = close_frame(&CloseReason::MissingParameter("Missing user_id or peer_id".into()))
            .unwrap();
        assert_eq!(missing.code, CloseCode::Policy);
        assert_eq!(missing.reason, "Missing user_id or peer_id");

        assert_eq!(close_frame(&CloseReason::AlreadyConnected).unwrap().code, CloseCode::Policy);
        assert_eq!(close_frame(&CloseReason::Shutdown).unwrap().code, CloseCode::Away);
        assert_eq!(close_frame(&CloseReason::Superseded).unwrap().code, CloseCode::Normal);
    }
}
