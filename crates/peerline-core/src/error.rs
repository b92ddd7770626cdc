use crate::frame::CloseReason;
use thiserror::Error;

/// Errors produced by the relay engine and its transports.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("already connected: {0}")]
    AlreadyConnected(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("forward failed: {0}")]
    ForwardWrite(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// The close reason reported to the connecting client, for errors the
    /// client is told about. Internal failures map to `None`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            RelayError::MissingParameter(detail) => Some(CloseReason::MissingParameter(detail.clone())),
            RelayError::AlreadyConnected(_) => Some(CloseReason::AlreadyConnected),
            _ => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
