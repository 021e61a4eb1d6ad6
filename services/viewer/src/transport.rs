//! Transport seam between sessions and the vision server.
//!
//! A [`Connector`] turns an endpoint into a stream of [`TransportMessage`]s.
//! The end of the stream means the peer closed the connection; an `Err`
//! item means the transport failed. Both only drive the session's state
//! machine and are never fatal.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Errors raised by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Protocol(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// One message delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Binary(Bytes),
    Text(String),
}

impl TransportMessage {
    pub fn len(&self) -> usize {
        match self {
            TransportMessage::Binary(b) => b.len(),
            TransportMessage::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound message stream for one connection.
pub type MessageStream = BoxStream<'static, Result<TransportMessage, TransportError>>;

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint` and return its inbound message stream.
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, TransportError>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, TransportError> {
        let (ws, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(endpoint))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))?
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(endpoint = %endpoint, status = %response.status(), "WebSocket handshake complete");

        // Not split: reading keeps answering pings on the same stream
        let stream = ws.filter_map(|item| async move {
            match item {
                Ok(Message::Binary(data)) => Some(Ok(TransportMessage::Binary(Bytes::from(data)))),
                Ok(Message::Text(text)) => Some(Ok(TransportMessage::Text(text))),
                Ok(Message::Close(_)) => None,
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Protocol(e.to_string()))),
            }
        });

        Ok(stream.boxed())
    }
}

/// Scheme accepted by [`WsConnector`]. TLS is not compiled in.
pub const WS_SCHEME: &str = "ws://";

fn check_scheme(base_url: &str) -> Result<(), TransportError> {
    if base_url.starts_with(WS_SCHEME) {
        Ok(())
    } else {
        Err(TransportError::InvalidEndpoint(format!(
            "unsupported scheme in {base_url:?}, expected {WS_SCHEME}"
        )))
    }
}

/// Build the per-camera video endpoint, `{base}/ws/video/{camera_id}`.
pub fn video_endpoint(base_url: &str, camera_id: &str) -> Result<String, TransportError> {
    check_scheme(base_url)?;
    if camera_id.is_empty() || camera_id.contains('/') || camera_id.contains(char::is_whitespace)
    {
        return Err(TransportError::InvalidEndpoint(format!(
            "invalid camera id {camera_id:?}"
        )));
    }
    Ok(format!("{}/ws/video/{}", base_url.trim_end_matches('/'), camera_id))
}

/// Build the notification side-channel endpoint, `{base}/ws/notifications`.
pub fn notifications_endpoint(base_url: &str) -> Result<String, TransportError> {
    check_scheme(base_url)?;
    Ok(format!("{}/ws/notifications", base_url.trim_end_matches('/')))
}
