use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const PING_INTERVAL: Duration = Duration::from_secs(50);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Outcome of one bounded read.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Message(serde_json::Value),
    /// Nothing arrived within the wait.
    Idle,
    /// The server ended the stream.
    Ended,
}

/// Kraken v2 public WebSocket connection.
///
/// Remembers every subscription it sent so a reconnect after the server
/// closes the socket resumes the same channels.
pub struct KrakenWebSocket {
    ws_url: String,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    subscriptions: Vec<serde_json::Value>,
    last_ping: Instant,
}

impl KrakenWebSocket {
    #[must_use]
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            stream: None,
            subscriptions: Vec::new(),
            last_ping: Instant::now(),
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connects to the WebSocket server
    ///
    /// # Errors
    /// Returns error if connection fails or server is unreachable
    pub async fn connect(&mut self) -> Result<()> {
        tracing::debug!(url = %self.ws_url, "Attempting WebSocket connection");

        let (ws_stream, response) = connect_async(&self.ws_url)
            .await
            .with_context(|| format!("Failed to connect to WebSocket at {}", self.ws_url))?;

        self.stream = Some(ws_stream);
        self.last_ping = Instant::now();
        tracing::info!(
            url = %self.ws_url,
            status = %response.status(),
            "WebSocket connected"
        );
        Ok(())
    }

    /// Sends a subscription request and remembers it for reconnects.
    ///
    /// # Errors
    /// Returns error if WebSocket is not connected or send fails
    pub async fn subscribe(&mut self, subscription: serde_json::Value) -> Result<()> {
        self.send_json(&subscription).await?;
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Receives the next JSON message, handling control frames and
    /// reconnecting on close. Waits at most `wait` for a frame so callers
    /// can check for shutdown between reads.
    ///
    /// # Errors
    /// Returns error if WebSocket is not connected, a receive fails, or a
    /// reconnect fails
    pub async fn next_event(&mut self, wait: Duration) -> Result<WsEvent> {
        loop {
            if self.last_ping.elapsed() > PING_INTERVAL {
                self.send_json(&serde_json::json!({"method": "ping"})).await?;
                self.last_ping = Instant::now();
                tracing::trace!("Sent ping to server");
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("WebSocket not connected"))?;

            let Ok(next) = tokio::time::timeout(wait, stream.next()).await else {
                return Ok(WsEvent::Idle);
            };
            let Some(msg) = next else {
                tracing::warn!("WebSocket stream ended");
                self.stream = None;
                return Ok(WsEvent::Ended);
            };

            match msg.context("WebSocket receive failed")? {
                Message::Text(text) => {
                    let json = serde_json::from_str(&text)
                        .with_context(|| format!("Invalid JSON from Kraken: {text}"))?;
                    return Ok(WsEvent::Message(json));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    tracing::trace!("Received control frame");
                }
                Message::Close(frame) => {
                    tracing::warn!(?frame, "WebSocket closed, reconnecting");
                    self.reconnect().await?;
                }
                Message::Binary(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Closes the connection. Subscriptions are forgotten.
    ///
    /// # Errors
    /// Returns error if the close handshake fails
    pub async fn close(&mut self) -> Result<()> {
        self.subscriptions.clear();
        if let Some(mut stream) = self.stream.take() {
            stream
                .close(None)
                .await
                .context("Failed to close WebSocket")?;
        }
        Ok(())
    }

    async fn send_json(&mut self, value: &serde_json::Value) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("WebSocket not connected"))?;
        stream
            .send(Message::Text(value.to_string()))
            .await
            .context("WebSocket send failed")
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        tokio::time::sleep(RECONNECT_DELAY).await;
        self.connect().await?;

        for subscription in self.subscriptions.clone() {
            self.send_json(&subscription).await?;
        }
        tracing::info!(
            subscriptions = self.subscriptions.len(),
            "Resubscribed after reconnect"
        );
        Ok(())
    }
}
