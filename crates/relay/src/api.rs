//! HTTP API: viewer stream endpoints, health checks and Prometheus metrics

use crate::ws;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, RawQuery, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use relay_lib::{
    calculator::BaselinePolicy,
    health::HealthRegistry,
    models::{EventFilters, LogOptions},
    observability::StructuredLogger,
    runtime::ContainerRuntime,
    stream::{EventProducer, LogProducer, Producer, PumpConfig, StatsProducer, StreamPump},
    ConnectionLifecycle, MetricCalculator,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared application state
pub struct AppState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub calculator: Arc<MetricCalculator>,
    pub baseline_policy: BaselinePolicy,
    pub health_registry: HealthRegistry,
    pub logger: StructuredLogger,
    pub pump: StreamPump,
    /// Root of every connection's cancellation token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        health_registry: HealthRegistry,
        logger: StructuredLogger,
        pump_config: PumpConfig,
    ) -> Self {
        Self {
            runtime,
            calculator: Arc::new(MetricCalculator::new()),
            baseline_policy: BaselinePolicy::default(),
            health_registry,
            logger,
            pump: StreamPump::new(pump_config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_baseline_policy(mut self, policy: BaselinePolicy) -> Self {
        self.baseline_policy = policy;
        self
    }

    pub fn with_calculator(mut self, calculator: Arc<MetricCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Health check response - returns 200 if healthy/degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health();

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness();

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Docker IDs and names accepted on the stream endpoints
pub fn is_valid_container_id(id: &str) -> bool {
    (12..=64).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn invalid_container_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "Invalid container ID format" })),
    )
        .into_response()
}

/// Upgrade and hand the socket to the pump
fn serve_stream<P: Producer>(
    upgrade: WebSocketUpgrade,
    state: Arc<AppState>,
    producer: P,
    target: String,
) -> Response {
    let max_message_size = state.pump.config().transport.max_message_size;
    upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let kind = producer.kind();
            state.logger.log_stream_opened(kind, &target);

            let (sink, inbound) = ws::split(socket);
            let lifecycle = ConnectionLifecycle::new(&state.shutdown);
            let report = state.pump.run(producer, sink, inbound, &lifecycle).await;

            state.logger.log_stream_closed(kind, &target, &report);
            state.health_registry.record_stream(kind, &report);
        })
}

async fn stats_stream(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_valid_container_id(&container_id) {
        return invalid_container_id();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let calculator = MetricCalculator::for_policy(&state.calculator, state.baseline_policy);
    let producer = StatsProducer::new(
        state.runtime.clone(),
        calculator,
        container_id.clone(),
        state.pump.config().min_emit_interval,
    );
    serve_stream(upgrade, state, producer, container_id)
}

/// `/ws/logs/:id` query parameters
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub follow: Option<bool>,
    pub tail: Option<u64>,
    pub since: Option<String>,
}

impl LogQuery {
    pub fn into_options(self) -> LogOptions {
        let defaults = LogOptions::default();
        LogOptions {
            follow: self.follow.unwrap_or(defaults.follow),
            tail: self.tail.unwrap_or(defaults.tail),
            since: self.since.filter(|since| !since.is_empty()),
            timestamps: defaults.timestamps,
        }
    }
}

async fn logs_stream(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    Query(query): Query<LogQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_valid_container_id(&container_id) {
        return invalid_container_id();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let options = query.into_options();
    debug!(container_id = %container_id, ?options, "Log stream requested");
    let producer = LogProducer::new(state.runtime.clone(), container_id.clone(), options);
    serve_stream(upgrade, state, producer, container_id)
}

/// Collect repeatable `type` and `action` parameters
pub fn parse_event_filters(query: Option<&str>) -> EventFilters {
    let mut filters = EventFilters::default();
    let Some(query) = query else {
        return filters;
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "type" => filters.types.push(value.into_owned()),
            "action" => filters.actions.push(value.into_owned()),
            _ => {}
        }
    }
    filters
}

async fn events_stream(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let filters = parse_event_filters(query.as_deref());
    let target = if filters.is_empty() {
        "all".to_string()
    } else {
        format!("type={:?} action={:?}", filters.types, filters.actions)
    };
    let producer = EventProducer::new(state.runtime.clone(), filters);
    serve_stream(upgrade, state, producer, target)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/ws/stats/:id", get(stats_stream))
        .route("/ws/logs/:id", get(logs_stream))
        .route("/ws/events", get(events_stream))
        .with_state(state)
}

/// Bind the listener and serve until `shutdown` is cancelled
pub async fn serve(address: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(addr = %address, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_validation() {
        assert!(is_valid_container_id("abcdef012345"));
        assert!(is_valid_container_id("my_web-app_01"));
        assert!(is_valid_container_id(&"a".repeat(64)));

        assert!(!is_valid_container_id("short"));
        assert!(!is_valid_container_id(&"a".repeat(65)));
        assert!(!is_valid_container_id("abcdef012345;rm"));
        assert!(!is_valid_container_id("abcdef/012345"));
        assert!(!is_valid_container_id("abcdef.012345"));
    }

    #[test]
    fn test_log_query_defaults() {
        let options = LogQuery::default().into_options();
        assert_eq!(options, LogOptions::default());

        let options = LogQuery {
            follow: Some(false),
            tail: Some(10),
            since: Some(String::new()),
        }
        .into_options();
        assert!(!options.follow);
        assert_eq!(options.tail, 10);
        assert_eq!(options.since, None);
        assert!(options.timestamps);
    }

    #[test]
    fn test_parse_event_filters() {
        assert!(parse_event_filters(None).is_empty());

        let filters =
            parse_event_filters(Some("type=container&action=start&action=die&type=&other=x"));
        assert_eq!(filters.types, vec!["container"]);
        assert_eq!(filters.actions, vec!["start", "die"]);
    }
}
