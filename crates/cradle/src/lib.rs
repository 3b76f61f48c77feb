//! cradle: persistent duplex message relay between a WebSocket client and a
//! worker running on its own thread.

pub mod config;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod receive;
pub mod send;
pub mod service;
pub mod supervisor;
pub mod termination;
pub mod transport;
pub mod worker;
mod version;

pub use config::{ParseErrorPolicy, RelayConfig};
pub use envelope::{Envelope, EnvelopeError, TERMINATE_FUNCTION};
pub use error::{QueueClosed, RelayError, TransportError, WorkerError};
pub use queue::{InboundQueue, OutboundSender, queue_pair};
pub use receive::{ReceiveExit, ReceiveReport, run_receive_loop};
pub use send::{SendExit, SendReport, run_send_loop};
pub use service::{HealthSnapshot, RelayService, ServiceStatus};
pub use supervisor::{ConnectionId, ConnectionReport, ConnectionState, ConnectionSupervisor};
pub use termination::{TerminateOnDrop, TerminationFlag};
pub use transport::{FrameReceiver, FrameSender, ServerConfig, serve, serve_on};
pub use version::{CRADLE_VERSION, PROTOCOL_VERSION, VersionInfo};
pub use worker::{EchoWorker, Worker, WorkerContext, WorkerRouter, spawn_worker};
