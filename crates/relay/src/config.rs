//! Relay configuration

use anyhow::{Context, Result};
use relay_lib::{BaselinePolicy, PumpConfig, TransportConfig};
use serde::Deserialize;
use std::time::Duration;

/// Output format of the process log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Name reported in structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for the stream, health and metrics endpoints
    #[serde(default = "default_port")]
    pub port: u16,

    /// Container runtime endpoint (`unix://`, `tcp://` or `http://`)
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Per-connection queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum spacing of emitted stats samples in milliseconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,

    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    /// Largest inbound viewer message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub baseline_policy: BaselinePolicy,

    /// Runtime reachability probe interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Time allowed for connections to drain on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Reset stats baselines when containers restart
    #[serde(default = "default_watch_restarts")]
    pub watch_restarts: bool,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "telemetry-relay".to_string())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_docker_host() -> String {
    match std::env::var("DOCKER_HOST") {
        Ok(host) if !host.trim().is_empty() => host,
        _ => relay_lib::runtime::DEFAULT_DOCKER_HOST.to_string(),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_stats_interval() -> u64 {
    1000
}

fn default_write_wait() -> u64 {
    10
}

fn default_pong_wait() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    512
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_watch_restarts() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            host: default_host(),
            port: default_port(),
            docker_host: default_docker_host(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            queue_capacity: default_queue_capacity(),
            stats_interval_ms: default_stats_interval(),
            write_wait_secs: default_write_wait(),
            pong_wait_secs: default_pong_wait(),
            max_message_size: default_max_message_size(),
            baseline_policy: BaselinePolicy::default(),
            health_check_interval_secs: default_health_check_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            watch_restarts: default_watch_restarts(),
        }
    }
}

impl RelayConfig {
    /// Load from an optional `relay.{toml,yaml,json}` file and `RELAY_*`
    /// environment variables, the latter taking precedence
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("relay").required(false))
            .add_source(config::Environment::with_prefix("RELAY").try_parsing(true));
        Self::from_builder(builder)
    }

    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = builder.build().context("Failed to read configuration")?;
        let parsed: RelayConfig = config
            .try_deserialize()
            .context("Invalid relay configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.pong_wait_secs == 0 {
            anyhow::bail!("pong_wait_secs must be at least 1");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig::new(
            Duration::from_secs(self.write_wait_secs),
            Duration::from_secs(self.pong_wait_secs),
            self.max_message_size,
        )
    }

    pub fn pump(&self) -> PumpConfig {
        PumpConfig {
            queue_capacity: self.queue_capacity,
            min_emit_interval: Duration::from_millis(self.stats_interval_ms),
            transport: self.transport(),
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_builder(config::Config::builder()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.baseline_policy, BaselinePolicy::Shared);
        assert!(config.watch_restarts);

        let pump = config.pump();
        assert_eq!(pump.queue_capacity, 100);
        assert_eq!(pump.min_emit_interval, Duration::from_secs(1));
        assert_eq!(pump.transport.write_wait, Duration::from_secs(10));
        assert_eq!(pump.transport.pong_wait, Duration::from_secs(60));
        assert_eq!(pump.transport.ping_period, Duration::from_secs(54));
        assert_eq!(pump.transport.max_message_size, 512);
    }

    #[test]
    fn test_overrides() {
        let builder = config::Config::builder()
            .set_override("port", 9090)
            .unwrap()
            .set_override("baseline_policy", "per_connection")
            .unwrap()
            .set_override("log_format", "pretty")
            .unwrap()
            .set_override("stats_interval_ms", 250)
            .unwrap();
        let config = RelayConfig::from_builder(builder).unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:9090");
        assert_eq!(config.baseline_policy, BaselinePolicy::PerConnection);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.pump().min_emit_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_zero_queue() {
        let builder = config::Config::builder()
            .set_override("queue_capacity", 0)
            .unwrap();
        assert!(RelayConfig::from_builder(builder).is_err());
    }
}
