//! HTTP client for the relay's health endpoints and stream URL building

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// API client for the relay
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid server URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Make a GET request whose error responses still carry a JSON body
    pub async fn get_with_status<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response")?;
        let parsed = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response ({}): {}", status, body))?;

        Ok((status, parsed))
    }

    /// WebSocket URL of a relay stream endpoint
    pub fn stream_url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        stream_url(&self.base_url, path, query)
    }
}

/// Resolve `path` against the server URL and switch to the WebSocket scheme
pub fn stream_url(base: &Url, path: &str, query: &[(&str, String)]) -> Result<Url> {
    let mut url = base.join(path).context("Invalid stream path")?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("Unsupported server URL scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot switch {} to {}", base, scheme))?;

    if !query.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));
    }

    Ok(url)
}
