use std::future::Future;
use std::time::Duration;

use pairlink_core::config::BackendConfig;
use pairlink_core::credential::CredentialHandle;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiError;
use crate::wire::{
    ApiEnvelope, CampaignStatusData, ConnectData, ErrorBody, LoginData, LoginRequest, QrData,
    StatusData, TestMessageData, TestMessageRequest,
};

/// Backend calls the session engine depends on.
///
/// Implemented over HTTP by [`HttpSessionApi`]; tests substitute scripted
/// doubles.
pub trait SessionApi: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> impl Future<Output = Result<ApiEnvelope<ConnectData>, ApiError>> + Send;

    fn status(&self) -> impl Future<Output = Result<ApiEnvelope<StatusData>, ApiError>> + Send;

    fn qr(&self) -> impl Future<Output = Result<ApiEnvelope<QrData>, ApiError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<ApiEnvelope<()>, ApiError>> + Send;

    fn send_test_message(
        &self,
        phone_number: &str,
        message: &str,
    ) -> impl Future<Output = Result<ApiEnvelope<TestMessageData>, ApiError>> + Send;

    fn campaign_status(
        &self,
        campaign_id: &str,
    ) -> impl Future<Output = Result<ApiEnvelope<CampaignStatusData>, ApiError>> + Send;
}

/// reqwest-backed [`SessionApi`] that attaches the current bearer credential
/// to every request.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    base: String,
    credential: CredentialHandle,
    connect_timeout: Duration,
}

impl HttpSessionApi {
    pub fn new(config: &BackendConfig, credential: CredentialHandle) -> Result<Self, ApiError> {
        let parsed = Url::parse(&config.api_url).map_err(|e| ApiError::InvalidBaseUrl {
            url: config.api_url.clone(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::InvalidBaseUrl {
                url: config.api_url.clone(),
                message: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            credential,
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Exchange email and password for a bearer credential.
    ///
    /// Unauthenticated; the caller stores the returned token.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginData, ApiError> {
        let request = self
            .client
            .post(self.endpoint("/auth/login"))
            .json(&LoginRequest { email, password });
        let envelope: ApiEnvelope<LoginData> = execute(request).await?;

        match envelope.data {
            Some(data) if envelope.success => Ok(data),
            _ => Err(ApiError::Rejected {
                status: 200,
                message: envelope
                    .message
                    .unwrap_or_else(|| "login failed".to_string()),
            }),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.endpoint(path));
        match self.credential.get() {
            Some(credential) => builder.bearer_auth(credential.token),
            None => builder,
        }
    }
}

impl SessionApi for HttpSessionApi {
    async fn connect(&self) -> Result<ApiEnvelope<ConnectData>, ApiError> {
        let request = self
            .request(Method::POST, "/whatsapp/connect")
            .timeout(self.connect_timeout);
        execute(request).await
    }

    async fn status(&self) -> Result<ApiEnvelope<StatusData>, ApiError> {
        execute(self.request(Method::GET, "/whatsapp/status")).await
    }

    async fn qr(&self) -> Result<ApiEnvelope<QrData>, ApiError> {
        execute(self.request(Method::GET, "/whatsapp/qr")).await
    }

    async fn disconnect(&self) -> Result<ApiEnvelope<()>, ApiError> {
        let envelope: ApiEnvelope<serde_json::Value> =
            execute(self.request(Method::POST, "/whatsapp/disconnect")).await?;
        Ok(ApiEnvelope {
            success: envelope.success,
            message: envelope.message,
            data: None,
        })
    }

    async fn send_test_message(
        &self,
        phone_number: &str,
        message: &str,
    ) -> Result<ApiEnvelope<TestMessageData>, ApiError> {
        let request = self
            .request(Method::POST, "/whatsapp/test-message")
            .json(&TestMessageRequest {
                phone_number,
                message,
            });
        execute(request).await
    }

    async fn campaign_status(
        &self,
        campaign_id: &str,
    ) -> Result<ApiEnvelope<CampaignStatusData>, ApiError> {
        let path = format!("/messages/bulk/{campaign_id}/status");
        execute(self.request(Method::GET, &path)).await
    }
}

async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
    let response = request.send().await.map_err(ApiError::from_reqwest)?;
    let status = response.status();
    let url = response.url().path().to_string();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message);
        let error = ApiError::from_status(status.as_u16(), message);
        if error.is_transient() {
            debug!(path = %url, status = status.as_u16(), "backend call failed");
        } else {
            warn!(path = %url, status = status.as_u16(), %error, "backend rejected call");
        }
        return Err(error);
    }

    response.json::<T>().await.map_err(ApiError::from_reqwest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pairlink_core::credential::Credential;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(uri: &str) -> BackendConfig {
        BackendConfig {
            api_url: format!("{uri}/api"),
            push_url: "ws://unused".to_string(),
            request_timeout_ms: 2_000,
            connect_timeout_ms: 200,
        }
    }

    fn api_for(server: &MockServer, credential: Option<Credential>) -> HttpSessionApi {
        HttpSessionApi::new(&backend(&server.uri()), CredentialHandle::new(credential))
            .expect("valid base url")
    }

    #[tokio::test]
    async fn status_sends_bearer_and_decodes_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/whatsapp/status"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "isConnected": false, "state": "restoring" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server, Some(Credential::new("tok-1", "user-1")));
        let envelope = api.status().await.expect("status should succeed");
        assert!(envelope.success);
        assert_eq!(
            envelope.data.and_then(|d| d.state),
            Some("restoring".to_string())
        );
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/whatsapp/status"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "success": false,
                "message": "jwt expired"
            })))
            .mount(&server)
            .await;

        let api = api_for(&server, Some(Credential::new("stale", "user-1")));
        assert_matches!(api.status().await, Err(ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn bad_request_carries_backend_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/whatsapp/qr"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "message": "No active session"
            })))
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        assert_matches!(
            api.qr().await,
            Err(ApiError::BadRequest { message }) if message == "No active session"
        );
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/whatsapp/disconnect"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        let err = api.disconnect().await.unwrap_err();
        assert_matches!(err, ApiError::Server { status: 502 });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn connect_uses_short_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/whatsapp/connect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": true }))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        assert_matches!(api.connect().await, Err(ApiError::Timeout));
    }

    #[tokio::test]
    async fn test_message_posts_camel_case_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/whatsapp/test-message"))
            .and(body_json(json!({
                "phoneNumber": "+15550001111",
                "message": "hello"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "messageId": "m-9" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        let envelope = api.send_test_message("+15550001111", "hello").await.unwrap();
        assert_eq!(
            envelope.data.and_then(|d| d.message_id),
            Some("m-9".to_string())
        );
    }

    #[tokio::test]
    async fn campaign_status_hits_bulk_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages/bulk/c-42/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "bulkMessage": {
                    "id": "c-42",
                    "status": "completed",
                    "progress": { "total": 2, "sent": 2, "failed": 0, "pending": 0 }
                }}
            })))
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        let campaign = api
            .campaign_status("c-42")
            .await
            .unwrap()
            .data
            .unwrap()
            .bulk_message;
        assert!(campaign.status.is_terminal());
        assert_eq!(campaign.progress.sent, 2);
    }

    #[tokio::test]
    async fn login_returns_token_and_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "user": { "id": "u-7" }, "token": "fresh" }
            })))
            .mount(&server)
            .await;

        let api = api_for(&server, None);
        let login = api.login("a@example.com", "pw").await.unwrap();
        assert_eq!(login.token, "fresh");
        assert_eq!(login.user.id, "u-7");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut config = backend("http://localhost");
        config.api_url = "ftp://example.com".to_string();
        assert_matches!(
            HttpSessionApi::new(&config, CredentialHandle::empty()),
            Err(ApiError::InvalidBaseUrl { .. })
        );
    }
}
