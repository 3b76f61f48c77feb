//! Per-connection queue pair.
//!
//! Two unbounded FIFO channels and the termination flag:
//! - outbound: worker → send loop → client
//! - inbound: client → receive loop → worker (consumed with blocking reads)
//!
//! [`queue_pair`] hands one half to the relay loops and the other to the
//! worker thread. Nothing here is shared between connections.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::{QueueClosed, WorkerError};
use crate::termination::TerminationFlag;

/// Create a fresh queue/flag set.
///
/// Must be called from inside a tokio runtime: the worker half keeps a
/// handle so it can wait on the inbound queue with a timeout.
pub fn queue_pair() -> (RelayQueues, WorkerQueues) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let termination = TerminationFlag::new();

    let relay = RelayQueues {
        outbound: OutboundReceiver { rx: outbound_rx },
        inbound: InboundSender { tx: inbound_tx },
        termination: termination.clone(),
    };
    let worker = WorkerQueues {
        inbound: InboundQueue {
            rx: inbound_rx,
            runtime: Handle::current(),
        },
        outbound: OutboundSender { tx: outbound_tx },
        termination,
    };
    (relay, worker)
}

/// Relay-side ends: drained by the send loop, fed by the receive loop.
pub struct RelayQueues {
    pub outbound: OutboundReceiver,
    pub inbound: InboundSender,
    pub termination: TerminationFlag,
}

/// Worker-side ends.
pub struct WorkerQueues {
    pub inbound: InboundQueue,
    pub outbound: OutboundSender,
    pub termination: TerminationFlag,
}

/// Send loop's end of the outbound queue.
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl OutboundReceiver {
    /// Next envelope, or `None` once every sender is gone and the queue is empty.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next already-enqueued envelope, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Envelopes currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Receive loop's end of the inbound queue.
pub struct InboundSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl InboundSender {
    pub fn push(&self, envelope: Envelope) -> Result<(), QueueClosed> {
        self.tx.send(envelope).map_err(|_| QueueClosed("inbound"))
    }
}

/// Worker's end of the inbound queue.
///
/// All methods block the calling thread; use them from the worker thread,
/// never from async code.
pub struct InboundQueue {
    rx: mpsc::UnboundedReceiver<Envelope>,
    runtime: Handle,
}

impl InboundQueue {
    /// Block until the next envelope arrives.
    ///
    /// Returns `None` once the receive loop has exited and the queue is drained.
    pub fn recv(&mut self) -> Option<Envelope> {
        self.rx.blocking_recv()
    }

    /// Block for at most `timeout`.
    ///
    /// `Ok(None)` on timeout, `Err` once the receive loop is gone.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, QueueClosed> {
        let rx = &mut self.rx;
        match self
            .runtime
            .block_on(tokio::time::timeout(timeout, rx.recv()))
        {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(QueueClosed("inbound")),
            Err(_elapsed) => Ok(None),
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// The worker's outbound callback.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl OutboundSender {
    /// Enqueue an envelope for the client.
    pub fn send(&self, envelope: Envelope) -> Result<(), QueueClosed> {
        self.tx.send(envelope).map_err(|_| QueueClosed("outbound"))
    }

    /// Enqueue a partial field set; absent fields take envelope defaults.
    pub fn send_fields(&self, fields: serde_json::Value) -> Result<(), WorkerError> {
        let envelope = Envelope::from_fields(fields)?;
        self.send(envelope)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
