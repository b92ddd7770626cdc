//! peerline-core: connection registry and relay engine.
//!
//! Relays frames between pairs of participants. Each participant holds one
//! long-lived connection registered under its own id; every frame it sends
//! is forwarded, unmodified and without storage, to the connection
//! registered under its peer id.

pub mod error;
pub mod frame;
pub mod handler;
pub mod memory;
pub mod params;
pub mod registry;
pub mod service;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use frame::{CloseReason, Frame};
pub use handler::{HandlerOutcome, HandlerState, RelayHandler, RelayOptions};
pub use params::{ConnectParams, MISSING_PARAMETER_REASON};
pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionToken, ReplacePolicy};
pub use service::RelayService;
pub use transport::{Connection, FrameReader, FrameWriter};
