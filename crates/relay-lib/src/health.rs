//! Health tracking for the relay
//!
//! Backs `/healthz` and `/readyz`. The runtime component is kept current by
//! [`monitor_runtime`]; the streams component by
//! [`HealthRegistry::record_stream`] each time a viewer connection closes.

use crate::models::{ConnectionState, StreamKind};
use crate::observability::StructuredLogger;
use crate::runtime::ContainerRuntime;
use crate::stream::PumpReport;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Serving, but viewers are losing frames or connections
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Healthy and degraded relays still answer 200 on `/healthz`
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last update
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn observed(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::observed(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::observed(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::observed(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Streams health as implied by one finished connection
    pub fn from_report(kind: StreamKind, report: &PumpReport) -> Self {
        if report.state == ConnectionState::Error {
            Self::degraded(format!("{} viewer connection failed: {}", kind, report.reason))
        } else if report.frames_dropped > 0 {
            Self::degraded(format!(
                "{} viewer fell behind, {} frames dropped",
                kind, report.frames_dropped
            ))
        } else {
            Self::healthy()
        }
    }
}

/// `/healthz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// `/readyz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    /// Container runtime reachability
    pub const RUNTIME: &str = "runtime";
    /// Outcome of the most recent viewer connection
    pub const STREAMS: &str = "streams";
}

/// Shared, lock-free view of component health and startup readiness
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<DashMap<&'static str, ComponentHealth>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy
    pub fn register(&self, name: &'static str) {
        self.components.insert(name, ComponentHealth::healthy());
    }

    pub fn set_healthy(&self, name: &'static str) {
        self.components.insert(name, ComponentHealth::healthy());
    }

    pub fn set_degraded(&self, name: &'static str, message: impl Into<String>) {
        self.components.insert(name, ComponentHealth::degraded(message));
    }

    pub fn set_unhealthy(&self, name: &'static str, message: impl Into<String>) {
        self.components.insert(name, ComponentHealth::unhealthy(message));
    }

    /// Fold a finished viewer connection into the streams component. A
    /// failed or lossy connection degrades it; a clean one restores it.
    pub fn record_stream(&self, kind: StreamKind, report: &PumpReport) {
        self.components
            .insert(components::STREAMS, ComponentHealth::from_report(kind, report));
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn health(&self) -> HealthResponse {
        let components: BTreeMap<String, ComponentHealth> = self
            .components
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse { status, components }
    }

    /// Ready once startup has finished and while no component is unhealthy
    pub fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("Relay not yet initialized".to_string()),
            };
        }

        let failing = self
            .components
            .iter()
            .find(|entry| entry.value().status == ComponentStatus::Unhealthy)
            .map(|entry| *entry.key());

        match failing {
            Some(name) => ReadinessResponse {
                ready: false,
                reason: Some(format!("Component {} is unhealthy", name)),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}

/// Ping the runtime every `every` and record the result under
/// [`components::RUNTIME`] until `cancel` fires
pub async fn monitor_runtime(
    registry: HealthRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    every: Duration,
    cancel: CancellationToken,
    logger: StructuredLogger,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_reachable: Option<bool> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reachable = match runtime.ping().await {
            Ok(()) => {
                registry.set_healthy(components::RUNTIME);
                if last_reachable != Some(true) {
                    logger.log_runtime_health(true, None);
                }
                true
            }
            Err(e) => {
                let detail = e.to_string();
                registry
                    .set_unhealthy(components::RUNTIME, format!("Runtime unreachable: {}", detail));
                if last_reachable != Some(false) {
                    logger.log_runtime_health(false, Some(&detail));
                }
                false
            }
        };
        last_reachable = Some(reachable);
    }
}
