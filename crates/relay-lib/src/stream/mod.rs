//! Per-connection stream pump
//!
//! One pump serves one viewer. It runs a producer task that reads from the
//! runtime and fills a bounded queue, and a consumer loop that drains the
//! queue to the transport while sending keepalive pings and enforcing the
//! read deadline. The two halves share nothing but the queue and the
//! connection's cancellation token:
//!
//! - the producer closing the queue (stream ended or failed) ends the
//!   consumer cleanly
//! - the consumer leaving (transport failure, deadline, cancellation)
//!   cancels the producer, whose next enqueue also fails
//!
//! `run` returns only after both halves are gone.

mod producers;
mod queue;

pub use producers::{EventProducer, LogProducer, Producer, StatsProducer};
pub use queue::{bounded, DropCounter, Pushed, QueueSender, Throttle};

use crate::error::{RelayError, Result};
use crate::lifecycle::{
    ConnectionLifecycle, FrameSink, InboundFrame, InboundStream, OutboundFrame, TransportConfig,
};
use crate::models::{ConnectionState, StreamKind};
use crate::observability::RelayMetrics;
use futures_util::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Per-connection pump settings
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Frames buffered between producer and consumer (default: 100)
    pub queue_capacity: usize,
    /// Minimum spacing between forwarded stats results (default: 1 second)
    pub min_emit_interval: Duration,
    pub transport: TransportConfig,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            min_emit_interval: Duration::from_secs(1),
            transport: TransportConfig::default(),
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The runtime stream reached its end
    SourceEnded,
    /// The producer failed (runtime unreachable, decode error)
    SourceFailed(String),
    Cancelled,
    PeerClosed,
    /// No keepalive acknowledgment within the read deadline
    ReadTimeout,
    ReadFailed(String),
    WriteFailed(String),
}

impl CloseReason {
    /// Terminal state for the attempt
    pub fn terminal_state(&self) -> ConnectionState {
        match self {
            CloseReason::ReadFailed(_) | CloseReason::WriteFailed(_) => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SourceEnded => f.write_str("source ended"),
            CloseReason::SourceFailed(e) => write!(f, "source failed: {}", e),
            CloseReason::Cancelled => f.write_str("cancelled"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ReadTimeout => f.write_str("read deadline exceeded"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Summary of a finished connection
#[derive(Debug, Clone)]
pub struct PumpReport {
    pub state: ConnectionState,
    pub reason: CloseReason,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// How the producer task finished
enum SourceOutcome {
    Ended,
    Failed(String),
    Cancelled,
}

pub struct StreamPump {
    config: PumpConfig,
    metrics: RelayMetrics,
}

impl StreamPump {
    pub fn new(config: PumpConfig) -> Self {
        Self {
            config,
            metrics: RelayMetrics::new(),
        }
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Serve one connection until the source ends, the transport fails, or
    /// the lifecycle is cancelled
    pub async fn run<P, S>(
        &self,
        producer: P,
        mut sink: S,
        mut inbound: InboundStream,
        lifecycle: &ConnectionLifecycle,
    ) -> PumpReport
    where
        P: Producer,
        S: FrameSink,
    {
        let kind = producer.kind();
        let (queue, mut rx) = bounded(self.config.queue_capacity, kind);
        let producer_token = lifecycle.token().child_token();

        let producer_task = {
            let queue = queue.clone();
            let token = producer_token.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => return SourceOutcome::Cancelled,
                    result = producer.run(&queue) => result,
                };
                match result {
                    Ok(()) => SourceOutcome::Ended,
                    // consumer already gone
                    Err(RelayError::QueueClosed) => SourceOutcome::Cancelled,
                    Err(e) => {
                        warn!(stream = %kind, error = %e, "Stream producer failed");
                        metrics.inc_runtime_errors(kind);
                        let _ = queue.offer(OutboundFrame::error(&e));
                        SourceOutcome::Failed(e.to_string())
                    }
                }
                // dropping `queue` here closes it
            })
        };
        let drops = queue.drop_counter();
        drop(queue);

        self.metrics.connection_opened(kind);
        lifecycle.mark_connected();

        let transport = &self.config.transport;
        let mut ping = interval_at(Instant::now() + transport.ping_period, transport.ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let read_deadline = sleep(transport.pong_wait);
        tokio::pin!(read_deadline);

        let mut frames_sent = 0u64;
        let exit = loop {
            tokio::select! {
                biased;

                _ = lifecycle.token().cancelled() => break CloseReason::Cancelled,

                _ = &mut read_deadline => break CloseReason::ReadTimeout,

                frame = inbound.next() => match frame {
                    Some(Ok(InboundFrame::Pong)) => {
                        read_deadline.as_mut().reset(Instant::now() + transport.pong_wait);
                    }
                    Some(Ok(InboundFrame::Other)) => {}
                    Some(Ok(InboundFrame::Close)) | None => break CloseReason::PeerClosed,
                    Some(Err(e)) => break CloseReason::ReadFailed(e.to_string()),
                },

                _ = ping.tick() => {
                    match self.write_or_cancel(&mut sink, OutboundFrame::Ping, lifecycle).await {
                        None => break CloseReason::Cancelled,
                        Some(Err(e)) => break CloseReason::WriteFailed(e.to_string()),
                        Some(Ok(())) => {}
                    }
                }

                item = rx.recv() => match item {
                    Some(frame) => {
                        match self.write_or_cancel(&mut sink, frame, lifecycle).await {
                            None => break CloseReason::Cancelled,
                            Some(Err(e)) => break CloseReason::WriteFailed(e.to_string()),
                            Some(Ok(())) => {}
                        }
                        frames_sent += 1;
                        self.metrics.inc_frames_sent(kind);
                    }
                    None => break CloseReason::SourceEnded,
                },
            }
        };

        // Tear the producer down and wait for it so nothing outlives `run`.
        producer_token.cancel();
        drop(rx);
        let outcome = match producer_task.await {
            Ok(outcome) => outcome,
            Err(e) => SourceOutcome::Failed(format!("producer task aborted: {}", e)),
        };
        let reason = match (exit, outcome) {
            (CloseReason::SourceEnded, SourceOutcome::Failed(e)) => CloseReason::SourceFailed(e),
            (exit, _) => exit,
        };

        if !matches!(reason, CloseReason::WriteFailed(_)) {
            match timeout(transport.write_wait, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(stream = %kind, error = %e, "Close frame not delivered"),
                Err(_) => debug!(stream = %kind, "Close frame timed out"),
            }
        }

        let state = reason.terminal_state();
        lifecycle.finish(state);
        self.metrics.connection_closed(kind);

        let report = PumpReport {
            state,
            reason,
            frames_sent,
            frames_dropped: drops.get(),
        };
        match report.state {
            ConnectionState::Error => warn!(
                stream = %kind,
                reason = %report.reason,
                frames_sent = report.frames_sent,
                "Stream connection failed"
            ),
            _ => info!(
                stream = %kind,
                reason = %report.reason,
                frames_sent = report.frames_sent,
                frames_dropped = report.frames_dropped,
                "Stream connection closed"
            ),
        }
        report
    }

    /// Write one frame, giving up early if the connection is cancelled
    async fn write_or_cancel<S: FrameSink>(
        &self,
        sink: &mut S,
        frame: OutboundFrame,
        lifecycle: &ConnectionLifecycle,
    ) -> Option<Result<()>> {
        tokio::select! {
            biased;
            _ = lifecycle.token().cancelled() => None,
            result = self.write(sink, frame) => Some(result),
        }
    }

    /// Write one frame under the write deadline
    async fn write<S: FrameSink>(&self, sink: &mut S, frame: OutboundFrame) -> Result<()> {
        let wait = self.config.transport.write_wait;
        let started = Instant::now();
        match timeout(wait, sink.send(frame)).await {
            Ok(result) => {
                result?;
                self.metrics
                    .observe_write_latency(started.elapsed().as_secs_f64());
                Ok(())
            }
            Err(_) => Err(RelayError::WriteTimeout(wait)),
        }
    }
}
