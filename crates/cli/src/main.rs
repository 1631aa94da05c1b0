//! Telemetry Relay viewer CLI
//!
//! Follows a relay's stats, log and event streams from the terminal,
//! reconnecting with backoff when the connection drops, and reports the
//! relay's health.

mod client;
mod commands;
mod config;
mod connector;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{status, watch};

/// Telemetry Relay viewer CLI
#[derive(Parser)]
#[command(name = "relayctl")]
#[command(author, version, about = "Viewer CLI for the Telemetry Relay", long_about = None)]
pub struct Cli {
    /// Relay base URL (can also be set via RELAY_URL env var)
    #[arg(long, env = "RELAY_URL")]
    pub server_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Consecutive reconnect attempts before a watch gives up
    #[arg(long)]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream live resource usage of a container
    Stats {
        /// Container ID or name
        container: String,
    },

    /// Stream a container's logs
    Logs {
        /// Container ID or name
        container: String,

        /// Number of lines to show from the end of the log
        #[arg(long, default_value_t = 100)]
        tail: u64,

        /// Print the current log and exit
        #[arg(long)]
        no_follow: bool,

        /// Only show lines since this timestamp (RFC 3339 or Unix seconds)
        #[arg(long)]
        since: Option<String>,
    },

    /// Stream container runtime events
    Events {
        /// Only events of this type (repeatable)
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<String>,

        /// Only events with this action (repeatable)
        #[arg(long = "action", value_name = "ACTION")]
        actions: Vec<String>,
    },

    /// Show relay health and readiness
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config = config::Config::load().context("Failed to load relayctl config")?;
    let server_url = file_config.server_url(cli.server_url);
    let max_retries = file_config.max_retries(cli.max_retries);

    // Initialize client
    let client = client::ApiClient::new(&server_url)?;

    // Execute command
    match cli.command {
        Commands::Stats { container } => {
            watch::watch(&client, watch::Stream::Stats { container }, cli.format, max_retries)
                .await?;
        }
        Commands::Logs {
            container,
            tail,
            no_follow,
            since,
        } => {
            let stream = watch::Stream::Logs {
                container,
                tail,
                follow: !no_follow,
                since,
            };
            watch::watch(&client, stream, cli.format, max_retries).await?;
        }
        Commands::Events { types, actions } => {
            watch::watch(&client, watch::Stream::Events { types, actions }, cli.format, max_retries)
                .await?;
        }
        Commands::Status => {
            status::show_status(&client, cli.format).await?;
        }
    }

    Ok(())
}
