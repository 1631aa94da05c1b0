//! Axum WebSocket adapter for the stream pump

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_lib::lifecycle::{FrameSink, InboundFrame, InboundStream, OutboundFrame};
use relay_lib::{RelayError, Result};

/// Write half of an upgraded viewer socket
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Binary(bytes) => Message::Binary(bytes),
            OutboundFrame::Ping => Message::Ping(Vec::new()),
        };
        self.inner.send(message).await.map_err(transport_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .send(Message::Close(None))
            .await
            .map_err(transport_error)
    }
}

/// Split a socket into the pump's sink and keepalive-aware inbound stream
pub fn split(socket: WebSocket) -> (WsSink, InboundStream) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, inbound(stream))
}

fn inbound(stream: SplitStream<WebSocket>) -> InboundStream {
    stream
        .map(|message| match message {
            Ok(Message::Pong(_)) => Ok(InboundFrame::Pong),
            Ok(Message::Close(_)) => Ok(InboundFrame::Close),
            Ok(_) => Ok(InboundFrame::Other),
            Err(e) => Err(transport_error(e)),
        })
        .boxed()
}

fn transport_error(e: axum::Error) -> RelayError {
    RelayError::Transport(e.to_string())
}
