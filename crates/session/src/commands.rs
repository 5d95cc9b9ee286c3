use std::sync::Arc;

use pairlink_api::{ApiEnvelope, ApiError, ConnectData, QrData, SessionApi};
use pairlink_core::state::{ConnectionState, PairingCode, PollStopReason};
use tracing::{debug, info, warn};

use crate::fetcher::StatusFetcher;
use crate::inflight::InflightRequests;
use crate::store::{PollSlot, ReconciliationStore};

const CONNECT_KEY: &str = "connect";
const QR_KEY: &str = "qr";
const DISCONNECT_KEY: &str = "disconnect";

const AUTH_FAILED: &str = "Authentication failed. Please login again.";
const CONNECT_PENDING: &str = "Connection initiated, checking status...";
const NO_ACTIVE_SESSION: &str = "No active session. Connect first.";

/// Normalised result of every command. Commands never return errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    pub qr: Option<PairingCode>,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            qr: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            qr: None,
        }
    }

    fn with_qr(mut self, qr: Option<PairingCode>) -> Self {
        self.qr = qr;
        self
    }
}

/// Prefer the backend's own wording when it sent any.
fn backend_message(error: &ApiError, fallback: &str) -> String {
    match error {
        ApiError::BadRequest { message } | ApiError::Rejected { message, .. }
            if !message.is_empty() =>
        {
            message.clone()
        }
        _ => fallback.to_string(),
    }
}

fn envelope_message<T>(envelope: &ApiEnvelope<T>, success: &str, failure: &str) -> String {
    envelope.message.clone().unwrap_or_else(|| {
        if envelope.success {
            success.to_string()
        } else {
            failure.to_string()
        }
    })
}

/// User-initiated operations: connect, disconnect, refresh the pairing code,
/// send a test message.
pub struct SessionCommands<A: SessionApi> {
    api: Arc<A>,
    store: Arc<ReconciliationStore>,
    fetcher: Arc<StatusFetcher<A>>,
    connect_requests: InflightRequests<Result<ApiEnvelope<ConnectData>, ApiError>>,
    qr_requests: InflightRequests<Result<ApiEnvelope<QrData>, ApiError>>,
    disconnect_requests: InflightRequests<Result<ApiEnvelope<()>, ApiError>>,
}

impl<A: SessionApi> SessionCommands<A> {
    pub fn new(
        api: Arc<A>,
        store: Arc<ReconciliationStore>,
        fetcher: Arc<StatusFetcher<A>>,
    ) -> Self {
        Self {
            api,
            store,
            fetcher,
            connect_requests: InflightRequests::new(),
            qr_requests: InflightRequests::new(),
            disconnect_requests: InflightRequests::new(),
        }
    }

    pub async fn connect(&self) -> CommandOutcome {
        let _loading = self.store.begin_loading();
        info!("requesting session connect");

        let api = Arc::clone(&self.api);
        let outcome = self
            .connect_requests
            .run(CONNECT_KEY, move || async move { api.connect().await })
            .await;

        match outcome {
            Ok(envelope) => {
                let mut qr = None;
                if envelope.success {
                    if let Some(data) = &envelope.data {
                        qr = data.pairing_code();
                        if data.is_connected {
                            self.store.propose(ConnectionState::open());
                        } else {
                            self.store.propose(ConnectionState::connecting(qr.clone()));
                            self.store.start_poller(PollSlot::Connection);
                        }
                    }
                }
                let message = envelope_message(&envelope, "Connection successful", "Connection failed");
                CommandOutcome {
                    success: envelope.success,
                    message,
                    qr,
                }
            }
            Err(ApiError::Timeout) => {
                info!("connect request timed out; polling for status");
                self.store.start_poller(PollSlot::Connection);
                CommandOutcome::ok(CONNECT_PENDING)
            }
            Err(ApiError::BadRequest { message }) => {
                // A 400 here is ambiguous: it may be a concurrent connect from
                // another client, or a genuinely malformed request.
                warn!(%message, "connect rejected with 400; polling for status anyway");
                self.store.start_poller(PollSlot::Connection);
                CommandOutcome::ok(CONNECT_PENDING)
            }
            Err(ApiError::Unauthorized) => CommandOutcome::failed(AUTH_FAILED),
            Err(error) => {
                warn!(%error, "connect failed");
                CommandOutcome::failed(backend_message(&error, "Failed to connect WhatsApp"))
            }
        }
    }

    pub async fn disconnect(&self) -> CommandOutcome {
        let _loading = self.store.begin_loading();
        self.store.stop_session_pollers(PollStopReason::Cancelled);
        info!("requesting session disconnect");

        let api = Arc::clone(&self.api);
        let outcome = self
            .disconnect_requests
            .run(DISCONNECT_KEY, move || async move { api.disconnect().await })
            .await;

        match outcome {
            Ok(envelope) if envelope.success => {
                self.store.propose(ConnectionState::not_connected());
                self.fetcher.invalidate_cache();
                if let Err(error) = self.fetcher.fetch_fresh().await {
                    debug!(%error, "post-disconnect status check failed");
                }
                CommandOutcome::ok(envelope_message(
                    &envelope,
                    "Disconnected successfully",
                    "Failed to disconnect",
                ))
            }
            Ok(envelope) => CommandOutcome::failed(envelope_message(
                &envelope,
                "Disconnected successfully",
                "Failed to disconnect",
            )),
            Err(ApiError::Unauthorized) => CommandOutcome::failed(AUTH_FAILED),
            Err(error) => {
                warn!(%error, "disconnect failed");
                CommandOutcome::failed(backend_message(&error, "Failed to disconnect WhatsApp"))
            }
        }
    }

    pub async fn refresh_qr(&self) -> CommandOutcome {
        let api = Arc::clone(&self.api);
        let outcome = self
            .qr_requests
            .run(QR_KEY, move || async move { api.qr().await })
            .await;

        match outcome {
            Ok(envelope) if envelope.success => {
                let qr = envelope
                    .data
                    .as_ref()
                    .and_then(|data| data.qr.clone())
                    .and_then(PairingCode::new);
                match qr {
                    Some(code) => {
                        self.store
                            .propose(ConnectionState::connecting(Some(code.clone())));
                        CommandOutcome::ok("QR code refreshed").with_qr(Some(code))
                    }
                    None => CommandOutcome::ok("No QR code available yet"),
                }
            }
            Ok(envelope) => CommandOutcome::failed(
                envelope
                    .message
                    .unwrap_or_else(|| "Failed to refresh QR code".to_string()),
            ),
            Err(ApiError::BadRequest { .. }) => CommandOutcome::failed(NO_ACTIVE_SESSION),
            Err(ApiError::Unauthorized) => CommandOutcome::failed(AUTH_FAILED),
            Err(error) => {
                debug!(%error, "qr refresh failed");
                CommandOutcome::failed("Failed to refresh QR code")
            }
        }
    }

    /// Pass-through to the backend; no effect on connection state.
    pub async fn send_test_message(&self, phone_number: &str, message: &str) -> CommandOutcome {
        match self.api.send_test_message(phone_number, message).await {
            Ok(envelope) => CommandOutcome {
                success: envelope.success,
                message: envelope_message(
                    &envelope,
                    "Message sent successfully",
                    "Failed to send message",
                ),
                qr: None,
            },
            Err(ApiError::Unauthorized) => CommandOutcome::failed(AUTH_FAILED),
            Err(error) => {
                debug!(%error, "test message failed");
                CommandOutcome::failed(backend_message(&error, "Failed to send message"))
            }
        }
    }
}
