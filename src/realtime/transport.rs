//! Transport seam for the realtime channel.
//!
//! The channel drives a `ChannelTransport`, so tests substitute a scripted
//! transport while production uses a WebSocket connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::realtime::protocol::{InboundMessage, OutboundFrame};

/// One live connection to the realtime endpoint
#[async_trait]
pub trait ChannelConnection: Send {
    /// Send one frame
    async fn send(&mut self, frame: &OutboundFrame) -> CoreResult<()>;

    /// Receive the next protocol message. `Ok(None)` means the peer closed
    /// the connection cleanly.
    async fn next_message(&mut self) -> CoreResult<Option<InboundMessage>>;

    /// Close the connection, ignoring errors on an already-dead socket
    async fn close(&mut self);
}

/// Factory for connections, one per (re)connect attempt
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, url: &str) -> CoreResult<Box<dyn ChannelConnection>>;
}

/// Production transport over tokio-tungstenite
#[derive(Debug, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> CoreResult<Box<dyn ChannelConnection>> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| CoreError::connection_with_source("WebSocket connect failed", e))?;
        debug!(status = %response.status(), "WebSocket handshake completed");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelConnection for WebSocketConnection {
    async fn send(&mut self, frame: &OutboundFrame) -> CoreResult<()> {
        let json = serde_json::to_string(frame)
            .map_err(|e| CoreError::connection(format!("Failed to encode frame: {}", e)))?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| CoreError::connection_with_source("WebSocket send failed", e))
    }

    async fn next_message(&mut self) -> CoreResult<Option<InboundMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        // Malformed frames are dropped, not fatal
                        warn!(error = %e, "Discarding malformed channel frame");
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| CoreError::connection_with_source("WebSocket pong failed", e))?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(CoreError::connection_with_source("WebSocket read failed", e))
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
