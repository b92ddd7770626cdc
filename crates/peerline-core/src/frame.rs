//! Relay payload frames and close reasons.

use std::fmt;

/// A single application frame carried by a connection.
///
/// The relay never inspects the payload; it forwards the frame kind and
/// bytes exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::Text(s.to_string())
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::Text(s)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(b: Vec<u8>) -> Self {
        Frame::Binary(b)
    }
}

/// Why the relay is closing a connection.
///
/// Carried in the transport's close frame so the client can tell a protocol
/// rejection apart from an orderly shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `user_id` or `peer_id` was absent or empty.
    MissingParameter(String),
    /// Another live connection already owns this `user_id`.
    AlreadyConnected,
    /// A newer connection registered under the same `user_id`.
    Superseded,
    /// The relay process is stopping.
    Shutdown,
    /// Orderly close with no reason attached.
    Normal,
}

impl CloseReason {
    /// Whether the close represents a rejected or failed session rather than
    /// a normal end.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            CloseReason::MissingParameter(_) | CloseReason::AlreadyConnected
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::MissingParameter(detail) => write!(f, "{detail}"),
            CloseReason::AlreadyConnected => f.write_str("user_id already connected"),
            CloseReason::Superseded => f.write_str("superseded by a newer connection"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::Normal => f.write_str(""),
        }
    }
}
