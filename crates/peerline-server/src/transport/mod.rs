//! Transport listeners feeding the relay.

pub mod websocket;
