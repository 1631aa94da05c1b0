//! Observability infrastructure for the telemetry relay
//!
//! Provides:
//! - Prometheus metrics (connections, forwarded/dropped frames, write latency)
//! - Structured JSON logging of connection lifecycle events with tracing

use crate::models::StreamKind;
use crate::stream::PumpReport;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for transport write latency (in seconds)
const WRITE_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RelayMetricsInner> = OnceLock::new();

struct RelayMetricsInner {
    connections_active: IntGaugeVec,
    connections_total: IntCounterVec,
    frames_sent: IntCounterVec,
    frames_dropped: IntCounterVec,
    runtime_errors: IntCounterVec,
    samples_calculated: IntCounter,
    baselines_tracked: IntGauge,
    write_latency_seconds: Histogram,
}

impl RelayMetricsInner {
    fn new() -> Self {
        Self {
            connections_active: register_int_gauge_vec!(
                "telemetry_relay_connections_active",
                "Viewer connections currently open",
                &["stream"]
            )
            .expect("Failed to register connections_active"),

            connections_total: register_int_counter_vec!(
                "telemetry_relay_connections_total",
                "Viewer connections accepted since start",
                &["stream"]
            )
            .expect("Failed to register connections_total"),

            frames_sent: register_int_counter_vec!(
                "telemetry_relay_frames_sent_total",
                "Data frames written to viewers",
                &["stream"]
            )
            .expect("Failed to register frames_sent"),

            frames_dropped: register_int_counter_vec!(
                "telemetry_relay_frames_dropped_total",
                "Frames discarded because a viewer queue was full",
                &["stream"]
            )
            .expect("Failed to register frames_dropped"),

            runtime_errors: register_int_counter_vec!(
                "telemetry_relay_runtime_errors_total",
                "Producer-fatal runtime errors",
                &["stream"]
            )
            .expect("Failed to register runtime_errors"),

            samples_calculated: register_int_counter!(
                "telemetry_relay_samples_calculated_total",
                "Raw stats samples run through the metric calculator"
            )
            .expect("Failed to register samples_calculated"),

            baselines_tracked: register_int_gauge!(
                "telemetry_relay_baselines_tracked",
                "Containers with a stored CPU baseline"
            )
            .expect("Failed to register baselines_tracked"),

            write_latency_seconds: register_histogram!(
                "telemetry_relay_write_latency_seconds",
                "Time spent writing one frame to a viewer",
                WRITE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register write_latency_seconds"),
        }
    }
}

/// Relay metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying collectors.
#[derive(Clone)]
pub struct RelayMetrics {
    _private: (),
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RelayMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RelayMetricsInner {
        GLOBAL_METRICS.get_or_init(RelayMetricsInner::new)
    }

    pub fn connection_opened(&self, kind: StreamKind) {
        let inner = self.inner();
        inner.connections_active.with_label_values(&[kind.as_str()]).inc();
        inner.connections_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn connection_closed(&self, kind: StreamKind) {
        self.inner()
            .connections_active
            .with_label_values(&[kind.as_str()])
            .dec();
    }

    pub fn active_connections(&self, kind: StreamKind) -> i64 {
        self.inner()
            .connections_active
            .with_label_values(&[kind.as_str()])
            .get()
    }

    pub fn inc_frames_sent(&self, kind: StreamKind) {
        self.inner().frames_sent.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn inc_frames_dropped(&self, kind: StreamKind) {
        self.inner()
            .frames_dropped
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_runtime_errors(&self, kind: StreamKind) {
        self.inner()
            .runtime_errors
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_samples_calculated(&self) {
        self.inner().samples_calculated.inc();
    }

    pub fn set_baselines_tracked(&self, count: usize) {
        self.inner().baselines_tracked.set(count as i64);
    }

    pub fn observe_write_latency(&self, duration_secs: f64) {
        self.inner().write_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for relay lifecycle events
///
/// Keeps a stable `event` field on every record so log pipelines can
/// filter connection churn without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, runtime_endpoint: &str) {
        info!(
            event = "relay_started",
            instance = %self.instance,
            version = %version,
            runtime = %runtime_endpoint,
            "Telemetry relay started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "relay_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Telemetry relay shutting down"
        );
    }

    pub fn log_stream_opened(&self, kind: StreamKind, target: &str) {
        info!(
            event = "stream_opened",
            instance = %self.instance,
            stream = %kind,
            resource = %target,
            "Viewer stream opened"
        );
    }

    pub fn log_stream_closed(&self, kind: StreamKind, target: &str, report: &PumpReport) {
        info!(
            event = "stream_closed",
            instance = %self.instance,
            stream = %kind,
            resource = %target,
            state = %report.state,
            reason = %report.reason,
            frames_sent = report.frames_sent,
            frames_dropped = report.frames_dropped,
            "Viewer stream closed"
        );
    }

    pub fn log_runtime_health(&self, reachable: bool, detail: Option<&str>) {
        if reachable {
            info!(
                event = "runtime_health",
                instance = %self.instance,
                reachable = true,
                "Container runtime reachable"
            );
        } else {
            warn!(
                event = "runtime_health",
                instance = %self.instance,
                reachable = false,
                detail = ?detail,
                "Container runtime unreachable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_metrics_creation() {
        // The Prometheus registry is process-global; handles share it.
        let metrics = RelayMetrics::new();
        let other = metrics.clone();

        metrics.connection_opened(StreamKind::Events);
        other.connection_opened(StreamKind::Events);
        metrics.connection_closed(StreamKind::Events);
        assert!(metrics.active_connections(StreamKind::Events) >= 1);

        metrics.inc_frames_sent(StreamKind::Stats);
        metrics.inc_frames_dropped(StreamKind::Stats);
        metrics.inc_samples_calculated();
        metrics.set_baselines_tracked(3);
        metrics.observe_write_latency(0.002);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("relay-0");
        assert_eq!(logger.instance, "relay-0");
    }
}
