//! Container runtime collaborator
//!
//! The relay never talks to a process-wide client. A runtime handle is
//! constructed once at startup and passed to every component that needs
//! it as `Arc<dyn ContainerRuntime>`.

mod docker;
#[cfg(any(test, feature = "test-util"))]
mod scripted;

pub use docker::{DockerEndpoint, DockerRuntime, DEFAULT_DOCKER_HOST};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{Script, ScriptedRuntime};

use crate::error::Result;
use crate::models::{EventFilters, LogOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// Raw body of a long-lived runtime response, in arrival order
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    /// Long-lived stats stream: consecutive JSON stats objects
    async fn stats(&self, container_id: &str) -> Result<ByteStream>;

    /// Multiplexed stdout/stderr log frames
    async fn logs(&self, container_id: &str, options: &LogOptions) -> Result<ByteStream>;

    /// Global lifecycle event stream: consecutive JSON event objects
    async fn events(&self, filters: &EventFilters) -> Result<ByteStream>;

    /// Release the handle. Later requests fail with `RuntimeClosed`.
    async fn close(&self);
}
