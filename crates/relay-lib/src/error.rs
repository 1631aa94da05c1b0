//! Error type shared by the relay core

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the relay core
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the streaming pipeline and its collaborators
#[derive(Debug, Error)]
pub enum RelayError {
    /// The runtime API could not be reached or the request failed mid-flight
    #[error("runtime request failed: {0}")]
    Runtime(String),

    /// The runtime answered with a non-success status
    #[error("runtime returned {status}: {message}")]
    RuntimeStatus { status: u16, message: String },

    /// The runtime handle was closed by its owner
    #[error("runtime client is closed")]
    RuntimeClosed,

    /// A JSON object from the runtime could not be decoded
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A frame could not be serialized for a viewer
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The viewer transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A write did not complete within the write deadline
    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    /// The consumer side of a stream queue is gone
    #[error("stream queue closed")]
    QueueClosed,
}

impl RelayError {
    pub(crate) fn decode(what: &'static str, source: serde_json::Error) -> Self {
        RelayError::Decode { what, source }
    }

    pub(crate) fn encode(what: &'static str, source: serde_json::Error) -> Self {
        RelayError::Encode { what, source }
    }
}

impl From<hyper::Error> for RelayError {
    fn from(err: hyper::Error) -> Self {
        RelayError::Runtime(err.to_string())
    }
}

impl From<hyper::http::Error> for RelayError {
    fn from(err: hyper::http::Error) -> Self {
        RelayError::Runtime(err.to_string())
    }
}
