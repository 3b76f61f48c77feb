//! Error types shared across the relay.

use std::time::Duration;

use crate::envelope::EnvelopeError;

/// Failure reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("transport failure: {0}")]
    Other(String),
}

/// A queue whose other end has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} queue closed")]
pub struct QueueClosed(pub &'static str);

/// Errors that end a send loop, a receive loop or the handshake.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("no initial message within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("peer closed the connection before sending an initial message")]
    ClosedBeforeHandshake,

    #[error("server shutting down")]
    ShuttingDown,
}

/// Errors returned by worker implementations.
///
/// These are logged at the worker thread boundary and never reach the client.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker failed: {message}")]
    Failed { message: String },

    #[error("no worker registered for function '{0}'")]
    UnknownFunction(String),

    /// Inbound or outbound queue gone; the message names which.
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_direction_survives_conversion() {
        let inbound: WorkerError = QueueClosed("inbound").into();
        assert!(matches!(inbound, WorkerError::QueueClosed(QueueClosed("inbound"))));
        assert_eq!(inbound.to_string(), "inbound queue closed");

        let outbound: WorkerError = QueueClosed("outbound").into();
        assert_eq!(outbound.to_string(), "outbound queue closed");
    }
}
