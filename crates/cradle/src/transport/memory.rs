//! In-process transport backed by tokio channels.
//!
//! The server side gets a [`MemorySender`] / [`MemoryReceiver`] pair that
//! plugs into the supervisor; the test or embedder drives the other end
//! through [`MemoryClient`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameReceiver, FrameSender};
use crate::envelope::{Envelope, EnvelopeError};
use crate::error::TransportError;

/// Frame travelling from the client towards the relay.
#[derive(Debug)]
enum ClientFrame {
    Text(String),
    ReadError(String),
    Close,
}

/// Frame delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryOptions {
    /// Fail the Nth write (1-based) and every write after it.
    pub fail_write_at: Option<usize>,
}

#[derive(Debug)]
struct Shared {
    connected: AtomicBool,
    writes: AtomicUsize,
    close_calls: AtomicUsize,
}

/// Create a connected in-memory transport.
pub fn connection() -> (MemorySender, MemoryReceiver, MemoryClient) {
    connection_with(MemoryOptions::default())
}

pub fn connection_with(options: MemoryOptions) -> (MemorySender, MemoryReceiver, MemoryClient) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        connected: AtomicBool::new(true),
        writes: AtomicUsize::new(0),
        close_calls: AtomicUsize::new(0),
    });

    let sender = MemorySender {
        tx: server_tx,
        shared: Arc::clone(&shared),
        fail_write_at: options.fail_write_at,
    };
    let receiver = MemoryReceiver {
        rx: client_rx,
        shared: Arc::clone(&shared),
    };
    let client = MemoryClient {
        tx: client_tx,
        rx: server_rx,
        shared,
    };
    (sender, receiver, client)
}

pub struct MemorySender {
    tx: mpsc::UnboundedSender<ServerFrame>,
    shared: Arc<Shared>,
    fail_write_at: Option<usize>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let attempt = self.shared.writes.fetch_add(1, Ordering::AcqRel) + 1;
        if self.fail_write_at.is_some_and(|n| attempt >= n) {
            return Err(TransportError::Other(format!(
                "injected write failure on frame {attempt}"
            )));
        }
        self.tx.send(ServerFrame::Binary(payload)).map_err(|_| {
            self.shared.connected.store(false, Ordering::Release);
            TransportError::Closed
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.close_calls.fetch_add(1, Ordering::AcqRel);
        self.shared.connected.store(false, Ordering::Release);
        self.tx
            .send(ServerFrame::Close)
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<ClientFrame>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn receive_text(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(ClientFrame::Text(text)) => Ok(Some(text)),
            Some(ClientFrame::ReadError(message)) => Err(TransportError::Other(message)),
            Some(ClientFrame::Close) | None => {
                self.shared.connected.store(false, Ordering::Release);
                Ok(None)
            }
        }
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<ClientFrame>,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
    shared: Arc<Shared>,
}

impl MemoryClient {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(ClientFrame::Text(text.into()));
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), EnvelopeError> {
        let bytes = envelope.to_json_bytes()?;
        self.send_text(String::from_utf8_lossy(&bytes).into_owned());
        Ok(())
    }

    /// Make the relay's next read fail with a transport error.
    pub fn fail_next_read(&self, message: impl Into<String>) {
        let _ = self.tx.send(ClientFrame::ReadError(message.into()));
    }

    /// Close from the client side.
    pub fn close(&self) {
        let _ = self.tx.send(ClientFrame::Close);
    }

    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.rx.recv().await
    }

    /// Read frames until the relay closes the connection or `timeout` elapses.
    ///
    /// Returns the decoded envelopes and whether a close was observed.
    pub async fn drain(&mut self, timeout: Duration) -> (Vec<Envelope>, bool) {
        let mut envelopes = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ServerFrame::Binary(bytes))) => match serde_json::from_slice(&bytes) {
                    Ok(envelope) => envelopes.push(envelope),
                    Err(e) => tracing::warn!(error = %e, "Undecodable frame from relay"),
                },
                Ok(Some(ServerFrame::Close)) | Ok(None) => return (envelopes, true),
                Err(_elapsed) => return (envelopes, false),
            }
        }
    }

    /// How many times the relay called `close()`.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}
