//! Per-connection lifecycle
//!
//! Tracks the [`ConnectionState`] of one viewer connection and owns its
//! cancellation token. The token is a child of the server's root token, so
//! shutting the server down tears every connection down with it, while
//! cancelling one connection leaves the others alone.

mod transport;

pub use transport::{FrameSink, InboundFrame, InboundStream, OutboundFrame, TransportConfig};

use crate::models::ConnectionState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ConnectionLifecycle {
    state: watch::Sender<ConnectionState>,
    token: CancellationToken,
}

impl ConnectionLifecycle {
    /// New attempt in `Connecting`, cancelled along with `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    /// New attempt with its own root token
    pub fn detached() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(token: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { state, token }
    }

    /// Handshake done; returns false if the attempt already ended
    pub fn mark_connected(&self) -> bool {
        self.transition(ConnectionState::Connected)
    }

    /// Move to a terminal state. Only the first call has an effect.
    pub fn finish(&self, state: ConnectionState) -> bool {
        debug_assert!(state.is_terminal());
        self.transition(state)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let applied = self.state.send_if_modified(|current| {
            if current.can_transition(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(state = %next, "Connection state changed");
        }
        applied
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cloneable handle that tears one connection down
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Idempotent; later calls are no-ops
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
