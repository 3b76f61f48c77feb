//! Send loop: outbound queue → connection.

use std::time::Duration;

use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::queue::OutboundReceiver;
use crate::termination::TerminationFlag;
use crate::transport::FrameSender;

/// Why the send loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendExit {
    /// Termination flag set or sentinel dequeued.
    Terminated,
    /// Connection no longer open.
    Disconnected,
    /// Worker dropped its outbound sender and the queue is empty.
    ProducerGone,
    /// Transport or encode failure.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub frames_sent: usize,
    pub exit: SendExit,
}

enum Next {
    Envelope(Envelope),
    Terminate,
    Exhausted,
}

/// Drain the outbound queue onto the connection until termination.
///
/// Every exit path sets the termination flag. The sentinel is never written.
pub async fn run_send_loop<S>(
    sender: &mut S,
    outbound: &mut OutboundReceiver,
    termination: &TerminationFlag,
    poll_interval: Duration,
) -> SendReport
where
    S: FrameSender + ?Sized,
{
    let _terminate = termination.guard();
    let mut frames_sent = 0;

    let exit = match pump(
        sender,
        outbound,
        termination,
        poll_interval,
        &mut frames_sent,
    )
    .await
    {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(error = %e, frames_sent, "Send loop failed");
            SendExit::Failed(e.to_string())
        }
    };

    tracing::debug!(?exit, frames_sent, "Send loop stopped");
    SendReport { frames_sent, exit }
}

async fn pump<S>(
    sender: &mut S,
    outbound: &mut OutboundReceiver,
    termination: &TerminationFlag,
    poll_interval: Duration,
    frames_sent: &mut usize,
) -> Result<SendExit, RelayError>
where
    S: FrameSender + ?Sized,
{
    let mut drain = None;
    loop {
        let envelope = match next_outbound(outbound, termination, poll_interval, &mut drain).await {
            Next::Envelope(envelope) if envelope.is_terminate() => {
                tracing::info!("Sentinel dequeued, stopping send loop");
                return Ok(SendExit::Terminated);
            }
            Next::Envelope(envelope) => envelope,
            Next::Terminate => {
                tracing::info!("Termination observed, stopping send loop");
                return Ok(SendExit::Terminated);
            }
            Next::Exhausted => return Ok(SendExit::ProducerGone),
        };

        if !sender.is_connected() {
            tracing::debug!("Connection closed, dropping outbound envelope");
            return Ok(SendExit::Disconnected);
        }

        let payload = envelope.to_json_bytes()?;
        sender.send_bytes(payload).await?;
        *frames_sent += 1;
        tracing::trace!(frame = *frames_sent, function = %envelope.function, "Frame sent");
    }
}

/// Flush budget fixed when the flag is first observed.
///
/// Only envelopes already queued at that moment are flushed, and only while
/// one poll interval lasts, so a worker that keeps producing cannot hold the
/// loop open.
struct Drain {
    remaining: usize,
    deadline: Instant,
}

impl Drain {
    fn start(outbound: &OutboundReceiver, poll_interval: Duration) -> Self {
        let remaining = outbound.len();
        tracing::debug!(queued = remaining, "Flushing queued envelopes before stopping");
        Self {
            remaining,
            deadline: Instant::now() + poll_interval,
        }
    }

    fn take(&mut self, outbound: &mut OutboundReceiver) -> Option<Envelope> {
        if self.remaining == 0 || Instant::now() >= self.deadline {
            return None;
        }
        self.remaining -= 1;
        outbound.try_recv()
    }
}

/// Wait for the next outbound envelope, re-checking the flag every poll interval.
///
/// Once the flag is set, envelopes already in the queue are still handed out
/// (the draining phase) within the [`Drain`] budget, then the sentinel is
/// synthesized.
async fn next_outbound(
    outbound: &mut OutboundReceiver,
    termination: &TerminationFlag,
    poll_interval: Duration,
    drain: &mut Option<Drain>,
) -> Next {
    loop {
        if termination.is_set() {
            let drain = drain.get_or_insert_with(|| Drain::start(outbound, poll_interval));
            return match drain.take(outbound) {
                Some(envelope) => Next::Envelope(envelope),
                None => Next::Terminate,
            };
        }
        match tokio::time::timeout(poll_interval, outbound.recv()).await {
            Ok(Some(envelope)) => return Next::Envelope(envelope),
            Ok(None) => return Next::Exhausted,
            Err(_elapsed) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::queue::{OutboundSender, queue_pair};
    use crate::transport::FrameReceiver;
    use crate::transport::memory::{self, MemoryOptions, ServerFrame};

    const POLL: Duration = Duration::from_millis(20);

    fn decode(frame: ServerFrame) -> Envelope {
        match frame {
            ServerFrame::Binary(bytes) => serde_json::from_slice(&bytes).unwrap(),
            ServerFrame::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn sends_in_fifo_order_then_stops_on_flag() {
        let (mut sender, _receiver, mut client) = memory::connection();
        let (mut relay, worker) = queue_pair();

        for input in ["e1", "e2", "e3"] {
            worker.outbound.send(Envelope::chat(input)).unwrap();
        }
        worker.termination.set();

        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert_eq!(report.exit, SendExit::Terminated);
        assert_eq!(report.frames_sent, 3);

        for expected in ["e1", "e2", "e3"] {
            assert_eq!(decode(client.recv().await.unwrap()).main_input, expected);
        }
    }

    #[tokio::test]
    async fn sentinel_is_never_transmitted() {
        let (mut sender, _receiver, mut client) = memory::connection();
        let (mut relay, worker) = queue_pair();

        worker.outbound.send(Envelope::chat("before")).unwrap();
        worker.outbound.send(Envelope::terminate()).unwrap();
        worker.outbound.send(Envelope::chat("after")).unwrap();

        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert_eq!(report.exit, SendExit::Terminated);
        assert_eq!(report.frames_sent, 1);
        assert!(relay.termination.is_set());

        assert_eq!(decode(client.recv().await.unwrap()).main_input, "before");
        drop(sender);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_failure_aborts_and_sets_flag() {
        let (mut sender, _receiver, mut client) = memory::connection_with(MemoryOptions {
            fail_write_at: Some(2),
        });
        let (mut relay, worker) = queue_pair();
        for input in ["f1", "f2", "f3"] {
            worker.outbound.send(Envelope::chat(input)).unwrap();
        }

        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert!(matches!(report.exit, SendExit::Failed(_)));
        assert_eq!(report.frames_sent, 1);
        assert!(relay.termination.is_set());

        assert_eq!(decode(client.recv().await.unwrap()).main_input, "f1");
        // f3 was never attempted
        assert_eq!(relay.outbound.try_recv().unwrap().main_input, "f3");
    }

    #[tokio::test]
    async fn stops_silently_when_disconnected() {
        let (mut sender, mut receiver, client) = memory::connection();
        let (mut relay, worker) = queue_pair();

        client.close();
        assert!(receiver.receive_text().await.unwrap().is_none());

        worker.outbound.send(Envelope::chat("orphan")).unwrap();
        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert_eq!(report.exit, SendExit::Disconnected);
        assert_eq!(report.frames_sent, 0);
    }

    #[tokio::test]
    async fn flag_set_while_idle_exits_within_poll_interval() {
        let (mut sender, _receiver, _client) = memory::connection();
        let (mut relay, _worker) = queue_pair();

        let setter = relay.termination.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.set();
        });

        let started = tokio::time::Instant::now();
        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert_eq!(report.exit, SendExit::Terminated);
        assert!(started.elapsed() < Duration::from_millis(30) + POLL * 5);
    }

    /// Enqueues a fresh envelope for every frame written, like a worker
    /// that produces as fast as the client drains.
    struct RefillingSender {
        inner: memory::MemorySender,
        producer: OutboundSender,
    }

    #[async_trait::async_trait]
    impl FrameSender for RefillingSender {
        async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
            let _ = self.producer.send(Envelope::chat("more"));
            self.inner.send_bytes(payload).await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.inner.close().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[tokio::test]
    async fn flush_after_termination_is_bounded() {
        let (inner, _receiver, mut client) = memory::connection();
        let (mut relay, worker) = queue_pair();
        let mut sender = RefillingSender {
            inner,
            producer: worker.outbound.clone(),
        };

        worker.outbound.send(Envelope::chat("q1")).unwrap();
        worker.outbound.send(Envelope::chat("q2")).unwrap();
        worker.termination.set();

        let report = tokio::time::timeout(
            POLL * 10,
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL),
        )
        .await
        .expect("send loop kept flushing a live producer");
        assert_eq!(report.exit, SendExit::Terminated);
        assert_eq!(report.frames_sent, 2);

        assert_eq!(decode(client.recv().await.unwrap()).main_input, "q1");
        assert_eq!(decode(client.recv().await.unwrap()).main_input, "q2");
        // produced during the flush, left behind
        assert_eq!(relay.outbound.len(), 2);
    }

    #[tokio::test]
    async fn producer_gone_ends_loop() {
        let (mut sender, _receiver, _client) = memory::connection();
        let (mut relay, worker) = queue_pair();
        worker.outbound.send(Envelope::chat("last")).unwrap();
        drop(worker);

        let report =
            run_send_loop(&mut sender, &mut relay.outbound, &relay.termination, POLL).await;
        assert_eq!(report.exit, SendExit::ProducerGone);
        assert_eq!(report.frames_sent, 1);
        assert!(relay.termination.is_set());
    }
}
