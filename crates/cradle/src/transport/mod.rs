//! Transport layer for cradle.
//!
//! The relay loops only need a frame sink and a frame source. Implementations:
//! - [`ws`]: axum WebSocket halves
//! - [`memory`]: in-process channels (tests, embedding)
//!
//! [`http`] is the acceptor that upgrades `/main` requests and hands each
//! connection to a fresh supervisor.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod http;
pub mod memory;
pub mod ws;

pub use http::{ServerConfig, serve, serve_on};

/// Write half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    /// Write one binary frame.
    async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection. Called exactly once by the supervisor.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// False once either side has closed.
    fn is_connected(&self) -> bool;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next text frame, `Ok(None)` when the peer has closed.
    ///
    /// Must be cancel-safe: the loops wrap it in a timeout and drop the
    /// future when the poll interval elapses.
    async fn receive_text(&mut self) -> Result<Option<String>, TransportError>;
}
