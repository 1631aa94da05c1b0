//! Transport seam between the pump and a concrete viewer socket

use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Deadlines and limits for one viewer transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time allowed to write one frame (default: 10 seconds)
    pub write_wait: Duration,
    /// Time allowed between keepalive acknowledgments (default: 60 seconds)
    pub pong_wait: Duration,
    /// Ping interval, shorter than `pong_wait` (default: 54 seconds)
    pub ping_period: Duration,
    /// Largest inbound message accepted from a viewer, in bytes
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60), 512)
    }
}

impl TransportConfig {
    /// Ping period is derived as 9/10 of `pong_wait`
    pub fn new(write_wait: Duration, pong_wait: Duration, max_message_size: usize) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size,
        }
    }
}

/// Frame written to a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
}

impl OutboundFrame {
    /// `{"error": "..."}` notice sent before a failing stream closes
    pub fn error(message: impl std::fmt::Display) -> Self {
        OutboundFrame::Text(serde_json::json!({ "error": message.to_string() }).to_string())
    }

    pub fn is_data(&self) -> bool {
        !matches!(self, OutboundFrame::Ping)
    }
}

/// Frame read from a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Keepalive acknowledgment
    Pong,
    Close,
    /// Anything else; viewers are not expected to send data
    Other,
}

pub type InboundStream = BoxStream<'static, Result<InboundFrame>>;

/// Write half of a viewer transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()>;

    /// Send a close frame and flush
    async fn close(&mut self) -> Result<()>;
}
