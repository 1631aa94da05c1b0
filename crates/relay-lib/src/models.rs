//! Core data models for the telemetry relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One metrics snapshot as reported by the runtime's stats stream.
///
/// Counters are cumulative. Fields the runtime omits or reports as `null`
/// decode to zero/empty so a stopped container never fails decoding.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawSample {
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default, deserialize_with = "null_as_default")]
    pub networks: HashMap<String, NetworkStats>,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
    #[serde(default)]
    pub pids_stats: PidsStats,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default, deserialize_with = "null_as_default")]
    pub system_cpu_usage: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub percpu_usage: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stats: HashMap<String, u64>,
}

impl MemoryStats {
    /// Page cache bytes: `cache` on cgroup v1, `inactive_file` on cgroup v2
    pub fn cache_bytes(&self) -> u64 {
        self.stats
            .get("cache")
            .or_else(|| self.stats.get("inactive_file"))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BlkioStats {
    #[serde(default, deserialize_with = "null_as_default")]
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PidsStats {
    #[serde(default)]
    pub current: u64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Derived per-sample statistics forwarded to stats viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedStats {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

/// Runtime lifecycle event as forwarded to event viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type", alias = "Type", default)]
    pub event_type: String,
    #[serde(alias = "Action", default)]
    pub action: String,
    #[serde(alias = "Actor", default)]
    pub actor: EventActor,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(alias = "ID", default)]
    pub id: String,
    #[serde(alias = "Attributes", default, deserialize_with = "null_as_default")]
    pub attributes: HashMap<String, String>,
}

impl TelemetryEvent {
    /// Attribute lookup on the event's actor
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.actor.attributes.get(key).map(String::as_str)
    }
}

/// Options for a per-container log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: u64,
    pub since: Option<String>,
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            tail: 100,
            since: None,
            timestamps: true,
        }
    }
}

/// Filters applied to the global event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilters {
    pub types: Vec<String>,
    pub actions: Vec<String>,
}

impl EventFilters {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.actions.is_empty()
    }
}

/// State of one logical stream connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// Terminal states end an attempt; a new attempt starts at `Connecting`
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// Whether `self -> next` is allowed within a single attempt
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, Error)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which stream a viewer connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stats,
    Logs,
    Events,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stats => "stats",
            StreamKind::Logs => "logs",
            StreamKind::Events => "events",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
