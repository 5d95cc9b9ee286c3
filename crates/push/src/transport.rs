use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pairlink_core::Credential;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::debug;
use url::Url;

use crate::error::PushError;
use crate::frame::Frame;

const TRANSPORT_CLOSE: &str = "transport close";

/// Where the push channel connects to, and how long the handshake may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEndpoint {
    pub url: Url,
    pub handshake_timeout: Duration,
}

impl PushEndpoint {
    pub fn new(url: &str, handshake_timeout: Duration) -> Result<Self, PushError> {
        let parsed = Url::parse(url).map_err(|e| PushError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(PushError::InvalidUrl {
                url: url.to_string(),
                message: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(Self {
            url: parsed,
            handshake_timeout,
        })
    }
}

/// What a transport hands back from [`PushTransport::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { reason: String },
}

pub trait PushTransport: Send + 'static {
    /// Open the channel. The credential travels both as a header and as
    /// the first `auth` frame.
    fn connect(
        endpoint: &PushEndpoint,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self, PushError>> + Send
    where
        Self: Sized;

    fn send(&mut self, frame: &Frame) -> impl Future<Output = Result<(), PushError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Inbound, PushError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), PushError>> + Send;
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn handshake_error(error: WsError) -> PushError {
    match error {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            PushError::AuthenticationFailed("Authentication rejected by push server".to_string())
        }
        other => PushError::Handshake(other.to_string()),
    }
}

impl PushTransport for WebSocketTransport {
    async fn connect(endpoint: &PushEndpoint, credential: &Credential) -> Result<Self, PushError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| PushError::InvalidUrl {
                url: endpoint.url.to_string(),
                message: e.to_string(),
            })?;
        let header = HeaderValue::from_str(&credential.bearer())
            .map_err(|e| PushError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (stream, response) = tokio::time::timeout(
            endpoint.handshake_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| PushError::Timeout)?
        .map_err(handshake_error)?;
        debug!(status = %response.status(), url = %endpoint.url, "push handshake complete");

        let mut transport = Self { stream };
        transport.send(&Frame::auth(&credential.token)).await?;
        Ok(transport)
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), PushError> {
        let text = frame.to_text()?;
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| PushError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Inbound, PushError> {
        loop {
            match self.stream.next().await {
                None => {
                    return Ok(Inbound::Closed {
                        reason: TRANSPORT_CLOSE.to_string(),
                    });
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(Inbound::Closed {
                        reason: TRANSPORT_CLOSE.to_string(),
                    });
                }
                Some(Err(error)) => return Err(PushError::Transport(error.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| TRANSPORT_CLOSE.to_string());
                    return Ok(Inbound::Closed { reason });
                }
                // Pings are answered by tungstenite; binary frames are not part
                // of the protocol.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), PushError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(error) => Err(PushError::Transport(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn endpoint_requires_websocket_scheme() {
        let endpoint = PushEndpoint::new("wss://push.example.com/socket", Duration::from_secs(10))
            .expect("wss endpoint");
        assert_eq!(endpoint.url.host_str(), Some("push.example.com"));

        assert_matches!(
            PushEndpoint::new("https://push.example.com", Duration::from_secs(10)),
            Err(PushError::InvalidUrl { .. })
        );
        assert_matches!(
            PushEndpoint::new("not a url", Duration::from_secs(10)),
            Err(PushError::InvalidUrl { .. })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreachable_server_is_retryable() {
        let endpoint =
            PushEndpoint::new("ws://127.0.0.1:9/socket", Duration::from_secs(2)).expect("endpoint");
        let credential = Credential::new("token", "user-1");
        let error = WebSocketTransport::connect(&endpoint, &credential)
            .await
            .err()
            .expect("connect should fail");
        assert!(error.is_retryable());
    }
}
