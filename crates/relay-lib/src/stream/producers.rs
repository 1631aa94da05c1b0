//! Producers pull from the runtime and fill a connection's queue
//!
//! A producer returning `Ok` means the runtime stream ended; an `Err` is
//! producer-fatal. Neither is retried here: the viewer reconnects.

use super::queue::{QueueSender, Throttle};
use crate::calculator::MetricCalculator;
use crate::decode::JsonStreamDecoder;
use crate::demux::LogFrameDemuxer;
use crate::error::{RelayError, Result};
use crate::lifecycle::OutboundFrame;
use crate::models::{EventFilters, LogOptions, RawSample, StreamKind, TelemetryEvent};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait Producer: Send + 'static {
    fn kind(&self) -> StreamKind;

    async fn run(self, queue: &QueueSender) -> Result<()>;
}

/// Stats path: decode samples, calculate, throttle, offer
pub struct StatsProducer {
    runtime: Arc<dyn ContainerRuntime>,
    calculator: Arc<MetricCalculator>,
    container_id: String,
    min_emit_interval: Duration,
}

impl StatsProducer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        calculator: Arc<MetricCalculator>,
        container_id: impl Into<String>,
        min_emit_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            calculator,
            container_id: container_id.into(),
            min_emit_interval,
        }
    }
}

#[async_trait]
impl Producer for StatsProducer {
    fn kind(&self) -> StreamKind {
        StreamKind::Stats
    }

    async fn run(self, queue: &QueueSender) -> Result<()> {
        let mut body = self.runtime.stats(&self.container_id).await?;
        let mut decoder = JsonStreamDecoder::<RawSample>::new("stats sample");
        let mut throttle = Throttle::new(self.min_emit_interval);

        while let Some(chunk) = body.next().await {
            for sample in decoder.feed(&chunk?)? {
                // Every sample refreshes the baseline, forwarded or not.
                let stats = self.calculator.calculate(&self.container_id, sample);
                if !throttle.admit(Instant::now()) {
                    continue;
                }

                let text = serde_json::to_string(&stats)
                    .map_err(|e| RelayError::encode("calculated stats", e))?;
                queue.offer(OutboundFrame::Text(text))?;
            }
        }

        debug!(container_id = %self.container_id, "Stats stream ended");
        Ok(())
    }
}

/// Logs path: strip frame headers and forward the text
pub struct LogProducer {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    options: LogOptions,
}

impl LogProducer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: impl Into<String>,
        options: LogOptions,
    ) -> Self {
        Self {
            runtime,
            container_id: container_id.into(),
            options,
        }
    }
}

/// Join the payloads completed by one read into a single frame
fn log_frame(payloads: Vec<Bytes>) -> Option<OutboundFrame> {
    let len: usize = payloads.iter().map(Bytes::len).sum();
    if len == 0 {
        return None;
    }

    let mut joined = Vec::with_capacity(len);
    for payload in payloads {
        joined.extend_from_slice(&payload);
    }

    Some(match String::from_utf8(joined) {
        Ok(text) => OutboundFrame::Text(text),
        Err(e) => OutboundFrame::Binary(e.into_bytes()),
    })
}

#[async_trait]
impl Producer for LogProducer {
    fn kind(&self) -> StreamKind {
        StreamKind::Logs
    }

    async fn run(self, queue: &QueueSender) -> Result<()> {
        let mut body = self.runtime.logs(&self.container_id, &self.options).await?;
        let mut demuxer = LogFrameDemuxer::new();

        while let Some(chunk) = body.next().await {
            if let Some(frame) = log_frame(demuxer.feed_payloads(&chunk?)) {
                // Log output is not dropped: wait for the consumer.
                queue.send(frame).await?;
            }
        }

        if demuxer.pending() > 0 {
            debug!(
                container_id = %self.container_id,
                pending = demuxer.pending(),
                "Log stream ended inside a frame"
            );
        }
        debug!(container_id = %self.container_id, "Log stream ended");
        Ok(())
    }
}

/// Events path: decode runtime events and re-encode them in viewer form
pub struct EventProducer {
    runtime: Arc<dyn ContainerRuntime>,
    filters: EventFilters,
}

impl EventProducer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, filters: EventFilters) -> Self {
        Self { runtime, filters }
    }
}

#[async_trait]
impl Producer for EventProducer {
    fn kind(&self) -> StreamKind {
        StreamKind::Events
    }

    async fn run(self, queue: &QueueSender) -> Result<()> {
        let mut body = self.runtime.events(&self.filters).await?;
        let mut decoder = JsonStreamDecoder::<TelemetryEvent>::new("runtime event");

        while let Some(chunk) = body.next().await {
            for event in decoder.feed(&chunk?)? {
                let text = serde_json::to_string(&event)
                    .map_err(|e| RelayError::encode("runtime event", e))?;
                queue.offer(OutboundFrame::Text(text))?;
            }
        }

        debug!("Event stream ended");
        Ok(())
    }
}
