//! Receive loop: connection → inbound queue.

use std::time::Duration;

use crate::config::ParseErrorPolicy;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::queue::InboundSender;
use crate::termination::TerminationFlag;
use crate::transport::FrameReceiver;

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveExit {
    /// Termination flag set by another activity.
    Terminated,
    /// Peer sent the sentinel frame.
    SentinelReceived,
    /// Peer closed the connection.
    PeerClosed,
    /// Transport failure or (under the fatal policy) a malformed frame.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Frames parsed into envelopes, sentinel excluded.
    pub frames_received: usize,
    pub realtime_discarded: usize,
    pub malformed_skipped: usize,
    pub exit: ReceiveExit,
}

#[derive(Default)]
struct Counters {
    frames_received: usize,
    realtime_discarded: usize,
    malformed_skipped: usize,
}

/// Read frames into the inbound queue until termination.
///
/// Takes ownership of the inbound sender so the worker's blocking reads end
/// when this loop does. Every exit path sets the termination flag.
pub async fn run_receive_loop<R>(
    receiver: &mut R,
    inbound: InboundSender,
    termination: &TerminationFlag,
    poll_interval: Duration,
    parse_errors: ParseErrorPolicy,
) -> ReceiveReport
where
    R: FrameReceiver + ?Sized,
{
    let _terminate = termination.guard();
    let mut counters = Counters::default();

    let exit = match pump(
        receiver,
        &inbound,
        termination,
        poll_interval,
        parse_errors,
        &mut counters,
    )
    .await
    {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(error = %e, frames_received = counters.frames_received, "Receive loop failed");
            ReceiveExit::Failed(e.to_string())
        }
    };
    drop(inbound);

    tracing::debug!(?exit, frames_received = counters.frames_received, "Receive loop stopped");
    ReceiveReport {
        frames_received: counters.frames_received,
        realtime_discarded: counters.realtime_discarded,
        malformed_skipped: counters.malformed_skipped,
        exit,
    }
}

async fn pump<R>(
    receiver: &mut R,
    inbound: &InboundSender,
    termination: &TerminationFlag,
    poll_interval: Duration,
    parse_errors: ParseErrorPolicy,
    counters: &mut Counters,
) -> Result<ReceiveExit, RelayError>
where
    R: FrameReceiver + ?Sized,
{
    loop {
        if termination.is_set() {
            tracing::info!("Termination observed, stopping receive loop");
            return Ok(ReceiveExit::Terminated);
        }

        let text = match tokio::time::timeout(poll_interval, receiver.receive_text()).await {
            Err(_elapsed) => continue,
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => {
                tracing::info!("Peer closed connection");
                return Ok(ReceiveExit::PeerClosed);
            }
            Ok(Err(e)) => return Err(e.into()),
        };

        let envelope = match Envelope::from_json(&text) {
            Ok(envelope) => envelope,
            Err(e) if parse_errors == ParseErrorPolicy::Skip => {
                counters.malformed_skipped += 1;
                tracing::warn!(error = %e, len = text.len(), "Dropping malformed frame");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if envelope.is_terminate() {
            tracing::info!("Sentinel received from peer, stopping receive loop");
            termination.set();
            return Ok(ReceiveExit::SentinelReceived);
        }

        counters.frames_received += 1;
        tracing::info!(
            frame = counters.frames_received,
            function = %envelope.function,
            realtime = envelope.realtime,
            "Received message"
        );

        if envelope.realtime {
            // No consumer for realtime frames yet.
            counters.realtime_discarded += 1;
            tracing::debug!("Discarding realtime frame");
            continue;
        }

        if inbound.push(envelope).is_err() {
            tracing::debug!("Worker no longer reading inbound queue, dropping frame");
        }
    }
}
