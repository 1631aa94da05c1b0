//! Telemetry relay - streams container stats, logs and runtime events to
//! WebSocket viewers.

use anyhow::{Context, Result};
use relay_lib::{
    calculator::watch_restarts,
    health::{components, monitor_runtime, HealthRegistry},
    observability::{RelayMetrics, StructuredLogger},
    runtime::{ContainerRuntime, DockerEndpoint, DockerRuntime},
    MetricCalculator, ReconnectPolicy,
};
use std::sync::Arc;
use telemetry_relay::{
    api,
    config::{LogFormat, RelayConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Resolves on SIGINT or SIGTERM with a description of the signal
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::load()?;
    init_tracing(&config);

    info!(instance = %config.instance, "Starting telemetry-relay");

    // Connect to the container runtime
    let endpoint = DockerEndpoint::parse(&config.docker_host)
        .with_context(|| format!("Invalid docker_host {}", config.docker_host))?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(endpoint.clone())
            .await
            .with_context(|| format!("Container runtime at {} is unreachable", endpoint))?,
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::RUNTIME);
    health_registry.register(components::STREAMS);

    // Initialize metrics and structured logger
    let _metrics = RelayMetrics::new();
    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(RELAY_VERSION, &endpoint.to_string());

    let shutdown = CancellationToken::new();
    let calculator = Arc::new(MetricCalculator::new());

    let mut background = Vec::new();
    background.push(tokio::spawn(monitor_runtime(
        health_registry.clone(),
        runtime.clone(),
        config.health_check_interval(),
        shutdown.clone(),
        logger.clone(),
    )));
    if config.watch_restarts {
        background.push(tokio::spawn(watch_restarts(
            runtime.clone(),
            calculator.clone(),
            ReconnectPolicy::default(),
            shutdown.clone(),
        )));
    }

    let app_state = Arc::new(
        api::AppState::new(
            runtime.clone(),
            health_registry.clone(),
            logger.clone(),
            config.pump(),
        )
        .with_calculator(calculator)
        .with_baseline_policy(config.baseline_policy)
        .with_shutdown(shutdown.clone()),
    );

    // Start stream, health and metrics server
    let address = config.bind_address();
    let mut server = tokio::spawn(async move { api::serve(&address, app_state).await });

    health_registry.set_ready(true);

    // Wait for a shutdown signal, or for the server to stop on its own
    let server_result = tokio::select! {
        reason = shutdown_signal() => {
            logger.log_shutdown(reason);
            None
        }
        result = &mut server => Some(result),
    };

    health_registry.set_ready(false);
    shutdown.cancel();

    let outcome = match server_result {
        Some(result) => Ok(result),
        None => tokio::time::timeout(config.shutdown_timeout(), &mut server).await,
    };
    let exit = match outcome {
        Ok(Ok(Ok(()))) => {
            info!("Server drained");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(e.context("API server failed")),
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("API server task panicked")),
        Err(_) => {
            warn!(
                timeout_secs = config.shutdown_timeout_secs,
                "Shutdown timeout elapsed, abandoning open connections"
            );
            server.abort();
            Ok(())
        }
    };

    for task in background {
        let _ = task.await;
    }
    runtime.close().await;
    info!("Shutdown complete");

    exit
}
