//! Worker boundary.
//!
//! The worker is the application logic behind a connection: it receives the
//! initial envelope, reads follow-up envelopes from the inbound queue at its
//! own pace and pushes replies through the outbound callback. It runs on a
//! dedicated OS thread so long or blocking work never stalls the relay loops.
//!
//! Whatever way the worker ends (return, error, panic) the connection's
//! termination flag is set; that is the only signal the supervisor gets.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::envelope::Envelope;
use crate::error::WorkerError;
use crate::queue::{InboundQueue, OutboundSender, WorkerQueues};
use crate::termination::TerminationFlag;

/// Application logic run once per connection.
pub trait Worker: Send + Sync + 'static {
    /// Run to completion. Blocking is fine: this is called on a dedicated thread.
    fn run(&self, initial: Envelope, ctx: WorkerContext) -> Result<(), WorkerError>;
}

impl<F> Worker for F
where
    F: Fn(Envelope, WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static,
{
    fn run(&self, initial: Envelope, ctx: WorkerContext) -> Result<(), WorkerError> {
        self(initial, ctx)
    }
}

/// Handles given to a running worker.
pub struct WorkerContext {
    /// Envelopes from the client, in arrival order.
    pub inbound: InboundQueue,
    /// Callback towards the client.
    pub outbound: OutboundSender,
    /// Set when the connection is shutting down; poll it to exit early.
    pub termination: TerminationFlag,
}

impl From<WorkerQueues> for WorkerContext {
    fn from(queues: WorkerQueues) -> Self {
        Self {
            inbound: queues.inbound,
            outbound: queues.outbound,
            termination: queues.termination,
        }
    }
}

/// Launch `worker` on its own thread.
///
/// The termination flag is set when the thread finishes, and also if the
/// thread cannot be spawned at all.
pub fn spawn_worker(
    worker: Arc<dyn Worker>,
    initial: Envelope,
    queues: WorkerQueues,
    thread_name: String,
) -> io::Result<JoinHandle<()>> {
    let terminate = queues.termination.guard();
    let ctx = WorkerContext::from(queues);
    let span = tracing::Span::current();

    std::thread::Builder::new().name(thread_name).spawn(move || {
        let _entered = span.enter();
        let _terminate = terminate;
        match run_guarded(worker.as_ref(), initial, ctx) {
            Ok(()) => tracing::info!("Worker completed"),
            Err(e) => tracing::error!(error = %e, "Worker failed"),
        }
    })
}

/// Run a worker, turning a panic into [`WorkerError::Panicked`].
pub fn run_guarded(
    worker: &dyn Worker,
    initial: Envelope,
    ctx: WorkerContext,
) -> Result<(), WorkerError> {
    match catch_unwind(AssertUnwindSafe(|| worker.run(initial, ctx))) {
        Ok(result) => result,
        Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

const FOLLOW_UP_POLL: Duration = Duration::from_millis(250);

/// Replies to each request by echoing it back as a chat turn.
///
/// With `follow_up`, keeps answering envelopes from the inbound queue until
/// one carries `special_state.stop`, the client goes away, or the
/// connection terminates.
#[derive(Debug, Clone, Default)]
pub struct EchoWorker {
    follow_up: bool,
}

impl EchoWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_follow_up(mut self, follow_up: bool) -> Self {
        self.follow_up = follow_up;
        self
    }

    fn reply(
        request: &Envelope,
        transcript: &mut Transcript,
        outbound: &OutboundSender,
    ) -> Result<(), WorkerError> {
        let answer = request.main_input.clone();
        transcript
            .chatbot
            .push((request.main_input.clone(), answer.clone()));
        transcript.history.push(request.main_input.clone());
        transcript.history.push(answer);

        outbound.send(Envelope {
            chatbot: transcript.chatbot.clone(),
            history: transcript.history.clone(),
            ..Envelope::default()
        })?;
        Ok(())
    }
}

struct Transcript {
    chatbot: Vec<(String, String)>,
    history: Vec<String>,
}

impl Worker for EchoWorker {
    fn run(&self, initial: Envelope, mut ctx: WorkerContext) -> Result<(), WorkerError> {
        let mut transcript = Transcript {
            chatbot: initial.chatbot.clone(),
            history: initial.history.clone(),
        };
        Self::reply(&initial, &mut transcript, &ctx.outbound)?;

        if !self.follow_up {
            return Ok(());
        }

        while !ctx.termination.is_set() {
            match ctx.inbound.recv_timeout(FOLLOW_UP_POLL) {
                Ok(Some(request)) if request.is_stop_requested() => {
                    tracing::debug!("Client requested stop");
                    break;
                }
                Ok(Some(request)) => Self::reply(&request, &mut transcript, &ctx.outbound)?,
                Ok(None) => continue,
                Err(_closed) => break,
            }
        }
        Ok(())
    }
}

/// Dispatches on the initial envelope's `function`.
#[derive(Default, Clone)]
pub struct WorkerRouter {
    routes: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, function: impl Into<String>, worker: impl Worker) -> Self {
        self.routes.insert(function.into(), Arc::new(worker));
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl Worker for WorkerRouter {
    fn run(&self, initial: Envelope, ctx: WorkerContext) -> Result<(), WorkerError> {
        let worker = self
            .routes
            .get(&initial.function)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownFunction(initial.function.clone()))?;
        tracing::debug!(function = %initial.function, "Dispatching to worker");
        worker.run(initial, ctx)
    }
}
