//! OpenAI Realtime API WebSocket transport
//!
//! `WsConnector` opens authenticated WebSocket connections; `WsLink` carries
//! JSON text frames over one of them. Session handshake and retries live in
//! the connection manager.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::connection::{BoxLink, Connector, Link};
use super::protocol::{DEFAULT_MODEL, DEFAULT_REALTIME_URL};
use super::ConnectionError;

/// Connects to the Realtime API with bearer authentication
#[derive(Clone)]
pub struct WsConnector {
    url: String,
    api_key: String,
}

impl WsConnector {
    /// `base_url` without query; the model is appended as `?model=`
    pub fn new(base_url: &str, model: &str, api_key: impl Into<String>) -> Self {
        Self {
            url: format!("{}?model={}", base_url.trim_end_matches('/'), model),
            api_key: api_key.into(),
        }
    }

    pub fn with_defaults(api_key: impl Into<String>) -> Self {
        Self::new(DEFAULT_REALTIME_URL, DEFAULT_MODEL, api_key)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect_ws(&self) -> Result<WsLink, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("Connecting to OpenAI Realtime API...");

        // disable_nagle: audio frames are small and latency-sensitive
        let (ws, _response) = connect_async_with_config(request, None, true)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                    ConnectionError::AuthenticationFailed("HTTP 401 Unauthorized".to_string())
                }
                other => ConnectionError::ConnectionFailed(other.to_string()),
            })?;

        Ok(WsLink { ws })
    }
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxLink, ConnectionError>> {
        Box::pin(async move {
            let link = self.connect_ws().await?;
            Ok(Box::new(link) as BoxLink)
        })
    }
}

/// One open WebSocket
pub struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Link for WsLink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.ws
                .send(Message::Text(text))
                .await
                .map_err(|e| ConnectionError::SendFailed(e.to_string()))
        })
    }

    fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>> {
        Box::pin(async move {
            loop {
                match self.ws.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Close(frame)) => {
                        log::info!("WebSocket closed by server: {:?}", frame);
                        return None;
                    }
                    Ok(_) => {} // ping/pong/binary
                    Err(tungstenite::Error::ConnectionClosed) => return None,
                    Err(e) => return Some(Err(ConnectionError::ProtocolError(e.to_string()))),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.ws.close(None).await {
                log::debug!("WebSocket close error (ignored): {}", e);
            }
        })
    }
}

/// Get OpenAI API key from environment
pub fn get_api_key() -> Result<String, ConnectionError> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or(ConnectionError::MissingApiKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_api_key_does_not_panic() {
        let _ = get_api_key();
    }

    #[test]
    fn test_connector_url_includes_model() {
        let connector = WsConnector::new("wss://example.test/v1/realtime/", "model-x", "sk-test");
        assert_eq!(connector.url(), "wss://example.test/v1/realtime?model=model-x");
    }

    #[test]
    fn test_connector_debug_redacts_key() {
        let connector = WsConnector::with_defaults("sk-secret");
        let debug = format!("{:?}", connector);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains(DEFAULT_MODEL));
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_realtime_connection() {
        let api_key = get_api_key().expect("OPENAI_API_KEY required");
        let connector = WsConnector::with_defaults(api_key);
        let mut link = connector.connect().await.expect("Connection failed");
        let first = link.next_text().await.expect("stream ended").expect("error");
        assert!(first.contains("session.created"));
        link.close().await;
    }
}
