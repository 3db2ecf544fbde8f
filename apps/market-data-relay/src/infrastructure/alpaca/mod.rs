//! Alpaca WebSocket Adapters
//!
//! Implements the upstream connection to Alpaca's stock market data stream.
//! Frames are JSON arrays; the relay forwards them unmodified.

pub mod upstream;

pub use upstream::{UpstreamError, WebSocketConnector};
