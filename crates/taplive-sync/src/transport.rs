//! Push-channel transport seam
//!
//! [`Connector`] opens one authenticated session; [`Transport`] is that
//! session. The connection manager only talks to these traits, so the
//! WebSocket implementation here and the loopback in [`crate::memory`] are
//! interchangeable.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use taplive_core::{ClientMessage, LiveError, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Opens authenticated sessions on the push channel
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, auth_token: &str) -> Result<Box<dyn Transport>>;
}

/// One open session
#[async_trait]
pub trait Transport: Send {
    /// Send a control message
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next text frame. `None` means the session is closed.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the session gracefully
    async fn close(&mut self) {}
}

/// WebSocket connector with bearer authentication
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, auth_token: &str) -> Result<Box<dyn Transport>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LiveError::Transport(format!("Invalid push URL {}: {}", self.url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth_token))
            .map_err(|e| LiveError::Transport(format!("Invalid credential: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| LiveError::Transport(format!("Failed to connect to {}: {}", self.url, e)))?;
        debug!("Push channel connected to {}", self.url);

        Ok(Box::new(WsTransport { stream }))
    }
}

/// WebSocket session
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = message.to_text()?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| LiveError::Transport(format!("Failed to send: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) | None => return None,
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(LiveError::Transport(format!("Read failed: {}", e))))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Push channel close failed: {}", e);
        }
    }
}
