//! WebSocket transport for the reconnecting viewer

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_lib::viewer::{Connector, MessageStream, ViewerMessage};
use relay_lib::{RelayError, Result};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Opens relay streams with tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, address: &str) -> Result<MessageStream> {
        let (socket, _) = connect_async(address)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        // Keepalive pings are answered by tungstenite while the stream is polled.
        let messages = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(ViewerMessage::text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(ViewerMessage::binary(&bytes))),
                Ok(_) => None,
                Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
            }
        });
        Ok(messages.boxed())
    }
}
