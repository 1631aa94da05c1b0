//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use relay_lib::{CalculatedStats, ConnectionState, TelemetryEvent};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines and tables (default)
    #[default]
    Table,
    /// Raw JSON as sent by the relay
    Json,
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    eprintln!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Color a percentage by how close it is to saturation
pub fn color_percent(percent: f64) -> String {
    let formatted = format!("{:6.2}%", percent);
    if percent >= 90.0 {
        formatted.red().to_string()
    } else if percent >= 70.0 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "connected" | "ready" => status.green().to_string(),
        "degraded" | "connecting" => status.yellow().to_string(),
        "unhealthy" | "error" | "not ready" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// One stats sample on a single line
pub fn format_stats_line(stats: &CalculatedStats) -> String {
    format!(
        "{}  CPU {}  MEM {} / {} ({})  NET {} rx {} tx  BLK {} r {} w  PIDS {}",
        stats.timestamp.format("%H:%M:%S"),
        color_percent(stats.cpu_percent),
        format_bytes(stats.memory_usage),
        format_bytes(stats.memory_limit),
        format!("{:.1}%", stats.memory_percent),
        format_bytes(stats.network_rx),
        format_bytes(stats.network_tx),
        format_bytes(stats.block_read),
        format_bytes(stats.block_write),
        stats.pids,
    )
}

/// One runtime event on a single line
pub fn format_event_line(event: &TelemetryEvent) -> String {
    let when = chrono::DateTime::from_timestamp(event.time, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| event.time.to_string());
    let id: String = event.actor.id.chars().take(12).collect();

    let mut line = format!(
        "{}  {:<10} {} {}",
        when,
        event.event_type,
        format!("{:<12}", event.action).cyan(),
        id
    );
    if let Some(name) = event.attribute("name") {
        line.push_str(&format!("  name={}", name));
    }
    line
}

/// Connection state as shown while watching
pub fn describe_state(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connecting => "Connecting...",
        ConnectionState::Connected => "Connected",
        ConnectionState::Disconnected => "Stream closed",
        ConnectionState::Error => "Connection failed",
    }
}
