//! Relay status command

use anyhow::Result;
use colored::Colorize;
use relay_lib::{ComponentStatus, HealthResponse, ReadinessResponse};
use serde::Serialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_success, print_warning, OutputFormat};

/// Health and readiness as reported by the relay
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub health: HealthResponse,
    pub readiness: ReadinessResponse,
}

/// Row for the components table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

fn status_name(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Query `/healthz` and `/readyz`; a 503 still carries a report
pub async fn fetch_status(client: &ApiClient) -> Result<StatusReport> {
    let (_, health) = client.get_with_status::<HealthResponse>("healthz").await?;
    let (_, readiness) = client
        .get_with_status::<ReadinessResponse>("readyz")
        .await?;
    Ok(StatusReport { health, readiness })
}

/// Show relay health and readiness
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report = fetch_status(client).await?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)?;
            println!("{}", json);
        }
        OutputFormat::Table => {
            println!("{}", "Relay Status".bold());
            println!("{}", "=".repeat(50));
            println!("Server:  {}", client.base_url().as_str().cyan());
            println!("Health:  {}", color_status(status_name(report.health.status)));
            let ready = if report.readiness.ready { "ready" } else { "not ready" };
            println!("Ready:   {}", color_status(ready));
            println!();

            let mut rows: Vec<ComponentRow> = report
                .health
                .components
                .iter()
                .map(|(name, component)| ComponentRow {
                    name: name.clone(),
                    status: color_status(status_name(component.status)),
                    message: component.message.clone().unwrap_or_default(),
                    last_check: format_timestamp(component.last_check_timestamp),
                })
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!();

            match &report.readiness.reason {
                Some(reason) => print_warning(reason),
                None => print_success("Relay is serving streams"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_status_reads_unavailable_bodies() {
        let mut server = mockito::Server::new_async().await;
        let health = server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"unhealthy","components":{
                    "runtime":{"status":"unhealthy","message":"Runtime unreachable: connection refused","last_check_timestamp":1700000000},
                    "streams":{"status":"healthy","last_check_timestamp":1700000000}}}"#,
            )
            .create_async()
            .await;
        let ready = server
            .mock("GET", "/readyz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ready":false,"reason":"Critical component unhealthy"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let report = fetch_status(&client).await.unwrap();

        assert_eq!(report.health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            report.health.components["runtime"].message.as_deref(),
            Some("Runtime unreachable: connection refused")
        );
        assert_eq!(report.health.components["streams"].status, ComponentStatus::Healthy);
        assert!(!report.readiness.ready);
        assert_eq!(
            report.readiness.reason.as_deref(),
            Some("Critical component unhealthy")
        );

        health.assert_async().await;
        ready.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_status_rejects_non_json() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/healthz")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = fetch_status(&client).await.unwrap_err();
        assert!(err.to_string().contains("502"), "{}", err);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
    }
}
