//! Telemetry relay server
//!
//! Axum front for the relay core: WebSocket stream endpoints for container
//! stats, logs and runtime events, plus health, readiness and metrics.

pub mod api;
pub mod config;
pub mod ws;
