//! Stream watch commands: stats, logs and events

use anyhow::{bail, Result};
use relay_lib::{
    viewer::{ClientReconnector, ViewerMessage},
    CalculatedStats, ConnectionState, ReconnectPolicy, TelemetryEvent,
};
use std::io::Write;
use url::Url;

use crate::client::ApiClient;
use crate::connector::TungsteniteConnector;
use crate::output::{
    describe_state, format_event_line, format_stats_line, print_error, print_info, print_warning,
    OutputFormat,
};

/// Which relay stream to follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stream {
    Stats {
        container: String,
    },
    Logs {
        container: String,
        tail: u64,
        follow: bool,
        since: Option<String>,
    },
    Events {
        types: Vec<String>,
        actions: Vec<String>,
    },
}

impl Stream {
    /// Endpoint path and query parameters
    fn endpoint(&self) -> (String, Vec<(&'static str, String)>) {
        match self {
            Stream::Stats { container } => (format!("ws/stats/{}", container), Vec::new()),
            Stream::Logs {
                container,
                tail,
                follow,
                since,
            } => {
                let mut query = vec![("follow", follow.to_string()), ("tail", tail.to_string())];
                if let Some(since) = since {
                    query.push(("since", since.clone()));
                }
                (format!("ws/logs/{}", container), query)
            }
            Stream::Events { types, actions } => {
                let query = types
                    .iter()
                    .map(|t| ("type", t.clone()))
                    .chain(actions.iter().map(|a| ("action", a.clone())))
                    .collect();
                ("ws/events".to_string(), query)
            }
        }
    }

    pub fn url(&self, client: &ApiClient) -> Result<Url> {
        let (path, query) = self.endpoint();
        client.stream_url(&path, &query)
    }

    /// A finished log dump is not reopened
    fn reconnects(&self) -> bool {
        !matches!(self, Stream::Logs { follow: false, .. })
    }
}

/// Render one relay message for the terminal
fn render(stream: &Stream, format: OutputFormat, message: &ViewerMessage) {
    if let Some(error) = error_notice(&message.text) {
        print_error(&format!("Relay reported: {}", error));
        return;
    }

    match (stream, format) {
        (Stream::Logs { .. }, _) => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(message.text.as_bytes());
            let _ = stdout.flush();
        }
        (_, OutputFormat::Json) => println!("{}", message.text),
        (Stream::Stats { .. }, OutputFormat::Table) => {
            match serde_json::from_str::<CalculatedStats>(&message.text) {
                Ok(stats) => println!("{}", format_stats_line(&stats)),
                Err(_) => println!("{}", message.text),
            }
        }
        (Stream::Events { .. }, OutputFormat::Table) => {
            match serde_json::from_str::<TelemetryEvent>(&message.text) {
                Ok(event) => println!("{}", format_event_line(&event)),
                Err(_) => println!("{}", message.text),
            }
        }
    }
}

/// `{"error": "..."}` notices the relay sends before closing a failed stream
fn error_notice(text: &str) -> Option<String> {
    if !text.starts_with("{\"error\"") {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("error")?.as_str().map(str::to_string)
}

enum Outcome {
    Interrupted,
    GaveUp,
}

/// Follow `stream` until Ctrl-C, reconnecting with backoff on failures
pub async fn watch(
    client: &ApiClient,
    stream: Stream,
    format: OutputFormat,
    max_retries: Option<u32>,
) -> Result<()> {
    let url = stream.url(client)?;
    let mut policy = ReconnectPolicy::default();
    if let Some(max_retries) = max_retries {
        policy = policy.with_max_attempts(max_retries);
    }
    if !stream.reconnects() {
        policy = policy.with_max_attempts(0);
    }

    let rendered = stream.clone();
    let reconnector = ClientReconnector::spawn(TungsteniteConnector, policy, move |message| {
        render(&rendered, format, &message)
    });
    let mut state = reconnector.subscribe();
    print_info(&format!("Watching {}", url));
    reconnector.set_target(Some(url.to_string()));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Outcome::Interrupted,
            _ = reconnector.given_up() => break Outcome::GaveUp,
            changed = state.changed() => {
                if changed.is_err() {
                    break Outcome::GaveUp;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Error {
                    print_warning(describe_state(current));
                } else if stream.reconnects() || current == ConnectionState::Connecting {
                    print_info(describe_state(current));
                }
            }
        }
    };

    let last_state = reconnector.state();
    match outcome {
        Outcome::Interrupted => {
            // cancel any scheduled reconnect before tearing down
            reconnector.set_target(None);
            reconnector.shutdown().await;
            Ok(())
        }
        Outcome::GaveUp => {
            reconnector.shutdown().await;
            if last_state == ConnectionState::Disconnected && !stream.reconnects() {
                return Ok(());
            }
            bail!("Gave up on {} ({})", url, describe_state(last_state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new("http://relay.local:8080").unwrap()
    }

    #[test]
    fn test_stats_url() {
        let stream = Stream::Stats {
            container: "0123456789ab".to_string(),
        };
        assert_eq!(
            stream.url(&client()).unwrap().as_str(),
            "ws://relay.local:8080/ws/stats/0123456789ab"
        );
        assert!(stream.reconnects());
    }

    #[test]
    fn test_logs_url_carries_options() {
        let stream = Stream::Logs {
            container: "0123456789ab".to_string(),
            tail: 20,
            follow: false,
            since: Some("2024-01-01T00:00:00Z".to_string()),
        };
        assert_eq!(
            stream.url(&client()).unwrap().as_str(),
            "ws://relay.local:8080/ws/logs/0123456789ab?follow=false&tail=20&since=2024-01-01T00%3A00%3A00Z"
        );
        assert!(!stream.reconnects());
    }

    #[test]
    fn test_events_url_repeats_filters() {
        let stream = Stream::Events {
            types: vec!["container".to_string()],
            actions: vec!["start".to_string(), "die".to_string()],
        };
        assert_eq!(
            stream.url(&client()).unwrap().as_str(),
            "ws://relay.local:8080/ws/events?type=container&action=start&action=die"
        );
    }

    #[test]
    fn test_error_notice() {
        assert_eq!(
            error_notice(r#"{"error":"runtime returned 404: No such container: abc"}"#).as_deref(),
            Some("runtime returned 404: No such container: abc")
        );
        assert_eq!(error_notice(r#"{"container_id":"abc"}"#), None);
        assert_eq!(error_notice("plain log line"), None);
    }
}
