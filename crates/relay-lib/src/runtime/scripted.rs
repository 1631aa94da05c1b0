//! In-memory runtime replaying canned response bodies
//!
//! Compiled for tests and under the `test-util` feature. Each request gets a
//! fresh copy of its script, so a reconnecting caller sees the same data
//! again.

use super::{ByteStream, ContainerRuntime};
use crate::error::{RelayError, Result};
use crate::models::{EventFilters, LogOptions};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum ScriptChunk {
    Data(Bytes),
    Fail(String),
}

/// Body of one scripted response
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: Vec<ScriptChunk>,
    hold_open: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one read's worth of bytes
    pub fn chunk(mut self, bytes: impl Into<Bytes>) -> Self {
        self.chunks.push(ScriptChunk::Data(bytes.into()));
        self
    }

    /// Append a mid-stream transport failure
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.chunks.push(ScriptChunk::Fail(message.into()));
        self
    }

    /// Keep the body open after the last chunk instead of ending it
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    fn into_stream(self) -> ByteStream {
        let items = stream::iter(self.chunks.into_iter().map(|chunk| match chunk {
            ScriptChunk::Data(bytes) => Ok(bytes),
            ScriptChunk::Fail(message) => Err(RelayError::Runtime(message)),
        }));

        if self.hold_open {
            items.chain(stream::pending()).boxed()
        } else {
            items.boxed()
        }
    }
}

#[derive(Default)]
pub struct ScriptedRuntime {
    stats: DashMap<String, Script>,
    logs: DashMap<String, Script>,
    events: Mutex<Option<Script>>,
    unreachable: AtomicBool,
    closed: AtomicBool,
    requests: AtomicUsize,
    log_requests: Mutex<Vec<(String, LogOptions)>>,
    event_requests: Mutex<Vec<EventFilters>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(self, container_id: &str, script: Script) -> Self {
        self.stats.insert(container_id.to_string(), script);
        self
    }

    pub fn with_logs(self, container_id: &str, script: Script) -> Self {
        self.logs.insert(container_id.to_string(), script);
        self
    }

    pub fn with_events(self, script: Script) -> Self {
        if let Ok(mut events) = self.events.lock() {
            *events = Some(script);
        }
        self
    }

    /// Make `ping` fail, as if the daemon went away
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of stream requests served so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn log_requests(&self) -> Vec<(String, LogOptions)> {
        self.log_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn event_requests(&self) -> Vec<EventFilters> {
        self.event_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn begin(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::RuntimeClosed);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn no_such_container(container_id: &str) -> RelayError {
    RelayError::RuntimeStatus {
        status: 404,
        message: format!("No such container: {}", container_id),
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::RuntimeClosed);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::Runtime("connection refused".to_string()));
        }
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<ByteStream> {
        self.begin()?;
        self.stats
            .get(container_id)
            .map(|script| script.clone().into_stream())
            .ok_or_else(|| no_such_container(container_id))
    }

    async fn logs(&self, container_id: &str, options: &LogOptions) -> Result<ByteStream> {
        self.begin()?;
        if let Ok(mut requests) = self.log_requests.lock() {
            requests.push((container_id.to_string(), options.clone()));
        }
        self.logs
            .get(container_id)
            .map(|script| script.clone().into_stream())
            .ok_or_else(|| no_such_container(container_id))
    }

    async fn events(&self, filters: &EventFilters) -> Result<ByteStream> {
        self.begin()?;
        if let Ok(mut requests) = self.event_requests.lock() {
            requests.push(filters.clone());
        }
        let script = self
            .events
            .lock()
            .ok()
            .and_then(|events| events.clone())
            .unwrap_or_else(|| Script::new().hold_open());
        Ok(script.into_stream())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
