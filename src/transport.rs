//! WebSocket transport layer
//!
//! Single responsibility: connect to the coordinator socket and send/receive
//! text frames. No knowledge of envelopes, signing, or session state.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::ClientError;

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// A connected WebSocket transport.
///
/// Can only be constructed via `Transport::connect()` - holding one means the
/// socket is open.
#[derive(Debug)]
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Connect to the coordinator endpoint.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        debug!(url = %url, "Connecting to coordinator");

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Origin", "http://localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| ClientError::Transport(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Send one text frame.
    pub async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to send: {}", e)))
    }

    /// Receive the next text frame.
    ///
    /// Returns None if the connection is closed. Ping/pong is handled by
    /// tungstenite; other non-text frames are skipped.
    pub async fn recv(&mut self) -> Result<Option<String>, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ClientError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }

    /// Split into separate sink and stream for concurrent send/receive.
    pub fn split(self) -> (WsSink, WsStream) {
        (self.sink, self.stream)
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("ws://localhost:8000/ws"), "localhost:8000");
        assert_eq!(extract_host("wss://clearing.example.com/ws"), "clearing.example.com");
        assert_eq!(extract_host("invalid"), "localhost");
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_transport_error() {
        // Port 1 is never listening
        let err = Transport::connect("ws://127.0.0.1:1/ws").await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.is_retryable());
    }
}
