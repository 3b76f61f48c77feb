//! Connection supervisor - owns one connection from first frame to close.
//!
//! Flow:
//! 1. Read the initial envelope (handshake)
//! 2. Allocate a fresh queue pair and termination flag
//! 3. Start the worker thread, run send and receive loops on this task
//! 4. Wait for both loops (never for the worker)
//! 5. Close the connection, whatever happened
//!
//! Nothing escapes this boundary as an error: the outcome is a
//! [`ConnectionReport`] and the client just sees the close.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::queue::{RelayQueues, queue_pair};
use crate::receive::{ReceiveReport, run_receive_loop};
use crate::send::{SendReport, run_send_loop};
use crate::transport::{FrameReceiver, FrameSender};
use crate::worker::{Worker, spawn_worker};

/// Unique identifier for a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one connection. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    AwaitingFirstMessage,
    ActiveExchange,
    /// Termination flag set; loops are winding down.
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingFirstMessage => "awaiting_first_message",
            Self::ActiveExchange => "active_exchange",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Outcome of a supervised connection.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub id: ConnectionId,
    /// Set when the connection closed before an exchange started.
    pub handshake_error: Option<String>,
    pub send: Option<SendReport>,
    pub receive: Option<ReceiveReport>,
}

impl ConnectionReport {
    fn handshake_only(id: ConnectionId, handshake_error: Option<String>) -> Self {
        Self {
            id,
            handshake_error,
            send: None,
            receive: None,
        }
    }

    pub fn frames_sent(&self) -> usize {
        self.send.as_ref().map_or(0, |r| r.frames_sent)
    }

    pub fn frames_received(&self) -> usize {
        self.receive.as_ref().map_or(0, |r| r.frames_received)
    }
}

/// One supervisor per accepted connection; never reused.
pub struct ConnectionSupervisor {
    id: ConnectionId,
    config: RelayConfig,
    worker: Arc<dyn Worker>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ConnectionSupervisor {
    pub fn new(worker: Arc<dyn Worker>, config: RelayConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::AwaitingFirstMessage);
        Self {
            id: ConnectionId::new(),
            config,
            worker,
            state_tx,
            shutdown: None,
        }
    }

    /// Terminate the connection once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Handshake, then [`run`](Self::run).
    pub async fn serve<S, R>(self, sender: S, receiver: R) -> ConnectionReport
    where
        S: FrameSender,
        R: FrameReceiver,
    {
        let span = tracing::info_span!("connection", id = %self.id);
        self.serve_inner(sender, receiver).instrument(span).await
    }

    /// Run the exchange for an already-received initial envelope.
    pub async fn run<S, R>(self, initial: Envelope, sender: S, receiver: R) -> ConnectionReport
    where
        S: FrameSender,
        R: FrameReceiver,
    {
        let span = tracing::info_span!("connection", id = %self.id);
        self.run_inner(initial, sender, receiver)
            .instrument(span)
            .await
    }

    async fn serve_inner<S, R>(self, mut sender: S, mut receiver: R) -> ConnectionReport
    where
        S: FrameSender,
        R: FrameReceiver,
    {
        match self.handshake(&mut receiver).await {
            Ok(initial) if initial.is_terminate() => {
                tracing::info!("Client terminated before the exchange started");
                self.close(&mut sender).await;
                ConnectionReport::handshake_only(self.id, None)
            }
            Ok(initial) => {
                tracing::info!(function = %initial.function, "Initial message received");
                self.run_inner(initial, sender, receiver).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "Handshake failed");
                self.close(&mut sender).await;
                ConnectionReport::handshake_only(self.id, Some(e.to_string()))
            }
        }
    }

    async fn handshake<R>(&self, receiver: &mut R) -> Result<Envelope, RelayError>
    where
        R: FrameReceiver,
    {
        let timeout = self.config.handshake_timeout;
        let first = tokio::select! {
            first = tokio::time::timeout(timeout, receiver.receive_text()) => first,
            _ = shutdown_requested(self.shutdown.clone()) => return Err(RelayError::ShuttingDown),
        };
        match first {
            Err(_elapsed) => Err(RelayError::HandshakeTimeout(timeout)),
            Ok(Ok(Some(text))) => Ok(Envelope::from_json(&text)?),
            Ok(Ok(None)) => Err(RelayError::ClosedBeforeHandshake),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn run_inner<S, R>(
        self,
        initial: Envelope,
        mut sender: S,
        mut receiver: R,
    ) -> ConnectionReport
    where
        S: FrameSender,
        R: FrameReceiver,
    {
        self.transition(ConnectionState::ActiveExchange);

        let (relay, worker_queues) = queue_pair();
        let RelayQueues {
            mut outbound,
            inbound,
            termination,
        } = relay;

        let thread_name = format!("cradle-{}", &self.id.to_string()[..8]);
        // Detached: completion is observed through the termination flag only.
        if let Err(e) = spawn_worker(
            Arc::clone(&self.worker),
            initial,
            worker_queues,
            thread_name,
        ) {
            tracing::error!(error = %e, "Failed to spawn worker thread");
        }

        let poll_interval = self.config.poll_interval;
        let draining = async {
            tokio::select! {
                _ = termination.terminated() => {
                    tracing::debug!("Termination flag set, draining");
                }
                _ = shutdown_requested(self.shutdown.clone()) => {
                    tracing::info!("Server shutting down, terminating connection");
                    termination.set();
                }
            }
            self.transition(ConnectionState::Draining);
        };

        let (send, receive, ()) = tokio::join!(
            run_send_loop(&mut sender, &mut outbound, &termination, poll_interval),
            run_receive_loop(
                &mut receiver,
                inbound,
                &termination,
                poll_interval,
                self.config.parse_errors,
            ),
            draining,
        );

        self.close(&mut sender).await;
        tracing::info!(
            frames_sent = send.frames_sent,
            frames_received = receive.frames_received,
            send_exit = ?send.exit,
            receive_exit = ?receive.exit,
            "Connection closed"
        );

        ConnectionReport {
            id: self.id,
            handshake_error: None,
            send: Some(send),
            receive: Some(receive),
        }
    }

    async fn close<S: FrameSender>(&self, sender: &mut S) {
        if let Err(e) = sender.close().await {
            tracing::warn!(error = %e, "Failed to close connection");
        }
        self.transition(ConnectionState::Closed);
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = next.as_str(), "Connection state changed");
        }
    }
}

/// Resolves once `shutdown` reads true; never without a receiver or once
/// the sender is gone.
async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    let Some(mut shutdown) = shutdown else {
        return std::future::pending().await;
    };
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
