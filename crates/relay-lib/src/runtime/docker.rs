//! Docker Engine API client
//!
//! Speaks HTTP/1.1 to the daemon over its Unix socket or a TCP endpoint,
//! one connection per request. Response bodies are handed back untouched:
//! the stats and event bodies carry consecutive JSON documents and the log
//! body carries multiplexed frames, both decoded further up the pipeline.

use super::{ByteStream, ContainerRuntime};
use crate::error::{RelayError, Result};
use crate::models::{EventFilters, LogOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info};
use url::{form_urlencoded, Url};

/// Daemon address used when `DOCKER_HOST` is unset
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Default port for `tcp://` endpoints without one
const DEFAULT_TCP_PORT: u16 = 2375;

/// Where the daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerEndpoint {
    /// Parse `unix:///path`, `tcp://host:port`, `http://host:port` or a bare
    /// socket path
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.starts_with('/') {
            return Ok(DockerEndpoint::Unix(PathBuf::from(raw)));
        }

        let url = Url::parse(raw)
            .map_err(|e| RelayError::Runtime(format!("invalid runtime endpoint {}: {}", raw, e)))?;

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(RelayError::Runtime(format!(
                        "runtime endpoint {} has no socket path",
                        raw
                    )));
                }
                Ok(DockerEndpoint::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" => {
                let host = url.host_str().ok_or_else(|| {
                    RelayError::Runtime(format!("runtime endpoint {} has no host", raw))
                })?;
                let port = url.port_or_known_default().unwrap_or(DEFAULT_TCP_PORT);
                Ok(DockerEndpoint::Tcp(format!("{}:{}", host, port)))
            }
            other => Err(RelayError::Runtime(format!(
                "unsupported runtime endpoint scheme: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Error body returned by the daemon on non-2xx responses
#[derive(Debug, Deserialize)]
struct DaemonMessage {
    message: String,
}

pub struct DockerRuntime {
    endpoint: DockerEndpoint,
    closed: AtomicBool,
}

impl DockerRuntime {
    /// Build a client without contacting the daemon
    pub fn new(endpoint: DockerEndpoint) -> Self {
        Self {
            endpoint,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a client and verify the daemon answers `/_ping`
    pub async fn connect(endpoint: DockerEndpoint) -> Result<Self> {
        let runtime = Self::new(endpoint);
        runtime.ping().await?;
        info!(endpoint = %runtime.endpoint, "Connected to container runtime");
        Ok(runtime)
    }

    pub fn endpoint(&self) -> &DockerEndpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<SendRequest<Empty<Bytes>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::RuntimeClosed);
        }

        match &self.endpoint {
            DockerEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    RelayError::Runtime(format!("connect {}: {}", path.display(), e))
                })?;
                handshake(stream).await
            }
            DockerEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| RelayError::Runtime(format!("connect {}: {}", addr, e)))?;
                handshake(stream).await
            }
        }
    }

    /// Issue a GET and fail on any non-2xx status
    async fn get(&self, path_and_query: &str) -> Result<Response<Incoming>> {
        let mut sender = self.open().await?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;

        debug!(uri = %path_and_query, "Runtime request");
        let response = sender.send_request(request).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.into_body().collect().await?.to_bytes();
            let message = serde_json::from_slice::<DaemonMessage>(&body)
                .map(|m| m.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());
            return Err(RelayError::RuntimeStatus { status, message });
        }

        Ok(response)
    }

    async fn get_stream(&self, path_and_query: &str) -> Result<ByteStream> {
        let response = self.get(path_and_query).await?;
        Ok(body_stream(response))
    }
}

async fn handshake<S>(stream: S) -> Result<SendRequest<Empty<Bytes>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Runtime connection closed with error");
        }
    });
    Ok(sender)
}

fn body_stream(response: Response<Incoming>) -> ByteStream {
    BodyStream::new(response.into_body())
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(RelayError::from)
        .boxed()
}

fn stats_path(container_id: &str) -> String {
    format!("/containers/{}/stats?stream=true", container_id)
}

fn logs_path(container_id: &str, options: &LogOptions) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("stdout", "true")
        .append_pair("stderr", "true")
        .append_pair("timestamps", bool_str(options.timestamps))
        .append_pair("follow", bool_str(options.follow))
        .append_pair("tail", &options.tail.to_string());
    if let Some(since) = options.since.as_deref().filter(|s| !s.is_empty()) {
        query.append_pair("since", since);
    }
    format!("/containers/{}/logs?{}", container_id, query.finish())
}

fn events_path(filters: &EventFilters) -> String {
    if filters.is_empty() {
        return "/events".to_string();
    }

    let mut map = serde_json::Map::new();
    if !filters.types.is_empty() {
        map.insert("type".to_string(), serde_json::json!(filters.types));
    }
    if !filters.actions.is_empty() {
        // the daemon filters actions under the "event" key
        map.insert("event".to_string(), serde_json::json!(filters.actions));
    }

    let encoded = form_urlencoded::Serializer::new(String::new())
        .append_pair("filters", &serde_json::Value::Object(map).to_string())
        .finish();
    format!("/events?{}", encoded)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let response = self.get("/_ping").await?;
        response.into_body().collect().await?;
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<ByteStream> {
        self.get_stream(&stats_path(container_id)).await
    }

    async fn logs(&self, container_id: &str, options: &LogOptions) -> Result<ByteStream> {
        self.get_stream(&logs_path(container_id, options)).await
    }

    async fn events(&self, filters: &EventFilters) -> Result<ByteStream> {
        self.get_stream(&events_path(filters)).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "Container runtime client closed");
        }
    }
}
