//! Core library for the telemetry relay
//!
//! This crate provides:
//! - The stateful metric calculator and its per-container baselines
//! - Incremental decoders for the runtime's JSON and framed log streams
//! - The per-connection stream pump with bounded backpressure
//! - Connection lifecycle and the viewer-side reconnecting client
//! - The container runtime client, health checks and observability

pub mod calculator;
pub mod decode;
pub mod demux;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod stream;
pub mod viewer;

pub use calculator::{BaselinePolicy, MetricCalculator};
pub use error::{RelayError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{CancelHandle, ConnectionLifecycle, TransportConfig};
pub use models::*;
pub use observability::{RelayMetrics, StructuredLogger};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use stream::{PumpConfig, PumpReport, StreamPump};
pub use viewer::{ClientReconnector, ReconnectPolicy};
