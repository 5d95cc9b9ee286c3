//! A [`SessionApi`] whose responses are queued up front by the test.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pairlink_api::{
    ApiEnvelope, ApiError, CampaignStatusData, ConnectData, QrData, SessionApi, StatusData,
    TestMessageData,
};
use serde_json::json;

type Outcome<T> = Result<ApiEnvelope<T>, ApiError>;

struct Responses<T> {
    queue: VecDeque<Outcome<T>>,
    fallback: Option<Outcome<T>>,
    calls: u32,
}

impl<T> Default for Responses<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            fallback: None,
            calls: 0,
        }
    }
}

impl<T: Clone> Responses<T> {
    fn next(&mut self, operation: &str) -> Outcome<T> {
        self.calls += 1;
        self.queue
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(ApiError::Network(format!("unscripted {operation} call"))))
    }
}

#[derive(Default)]
struct Script {
    connect: Responses<ConnectData>,
    status: Responses<StatusData>,
    qr: Responses<QrData>,
    disconnect: Responses<()>,
    test_message: Responses<TestMessageData>,
    campaign: Responses<CampaignStatusData>,
    latency: Option<Duration>,
    campaign_ids: Vec<String>,
    test_messages: Vec<(String, String)>,
}

/// Scripted backend. Clones share the same script and call counters.
///
/// Each operation pops its next queued response; once the queue is empty
/// the fallback (if set) is repeated, otherwise a network error is
/// returned.
#[derive(Clone, Default)]
pub struct ScriptedApi {
    script: Arc<Mutex<Script>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("failed to lock api script")
    }

    /// Delay applied to every response, in (possibly paused) tokio time.
    pub fn set_latency(&self, latency: Duration) {
        self.script().latency = Some(latency);
    }

    pub fn push_connect(&self, outcome: Outcome<ConnectData>) {
        self.script().connect.queue.push_back(outcome);
    }

    pub fn push_status(&self, outcome: Outcome<StatusData>) {
        self.script().status.queue.push_back(outcome);
    }

    pub fn set_status_fallback(&self, outcome: Outcome<StatusData>) {
        self.script().status.fallback = Some(outcome);
    }

    pub fn push_qr(&self, outcome: Outcome<QrData>) {
        self.script().qr.queue.push_back(outcome);
    }

    pub fn push_disconnect(&self, outcome: Outcome<()>) {
        self.script().disconnect.queue.push_back(outcome);
    }

    pub fn push_test_message(&self, outcome: Outcome<TestMessageData>) {
        self.script().test_message.queue.push_back(outcome);
    }

    pub fn push_campaign(&self, outcome: Outcome<CampaignStatusData>) {
        self.script().campaign.queue.push_back(outcome);
    }

    pub fn connect_calls(&self) -> u32 {
        self.script().connect.calls
    }

    pub fn status_calls(&self) -> u32 {
        self.script().status.calls
    }

    pub fn qr_calls(&self) -> u32 {
        self.script().qr.calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.script().disconnect.calls
    }

    pub fn campaign_calls(&self) -> u32 {
        self.script().campaign.calls
    }

    pub fn campaign_ids(&self) -> Vec<String> {
        self.script().campaign_ids.clone()
    }

    pub fn test_messages(&self) -> Vec<(String, String)> {
        self.script().test_messages.clone()
    }

    fn respond<T: Send + 'static>(
        &self,
        outcome: Outcome<T>,
    ) -> impl Future<Output = Outcome<T>> + Send + 'static {
        let latency = self.script().latency;
        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            outcome
        }
    }
}

impl SessionApi for ScriptedApi {
    fn connect(&self) -> impl Future<Output = Outcome<ConnectData>> + Send {
        let outcome = self.script().connect.next("connect");
        self.respond(outcome)
    }

    fn status(&self) -> impl Future<Output = Outcome<StatusData>> + Send {
        let outcome = self.script().status.next("status");
        self.respond(outcome)
    }

    fn qr(&self) -> impl Future<Output = Outcome<QrData>> + Send {
        let outcome = self.script().qr.next("qr");
        self.respond(outcome)
    }

    fn disconnect(&self) -> impl Future<Output = Outcome<()>> + Send {
        let outcome = self.script().disconnect.next("disconnect");
        self.respond(outcome)
    }

    fn send_test_message(
        &self,
        phone_number: &str,
        message: &str,
    ) -> impl Future<Output = Outcome<TestMessageData>> + Send {
        let outcome = {
            let mut script = self.script();
            script
                .test_messages
                .push((phone_number.to_string(), message.to_string()));
            script.test_message.next("test-message")
        };
        self.respond(outcome)
    }

    fn campaign_status(
        &self,
        campaign_id: &str,
    ) -> impl Future<Output = Outcome<CampaignStatusData>> + Send {
        let outcome = {
            let mut script = self.script();
            script.campaign_ids.push(campaign_id.to_string());
            script.campaign.next("campaign-status")
        };
        self.respond(outcome)
    }
}

fn envelope<T>(data: T) -> Outcome<T> {
    Ok(ApiEnvelope {
        success: true,
        message: None,
        data: Some(data),
    })
}

pub fn status_ok(state: &str, is_connected: bool, qr: Option<&str>) -> Outcome<StatusData> {
    envelope(StatusData {
        is_connected,
        state: Some(state.to_string()),
        qr: qr.map(str::to_string),
    })
}

pub fn connect_ok(is_connected: bool, qr: Option<&str>) -> Outcome<ConnectData> {
    envelope(ConnectData {
        is_connected,
        qr: qr.map(str::to_string),
    })
}

pub fn qr_ok(qr: Option<&str>) -> Outcome<QrData> {
    envelope(QrData {
        is_connected: false,
        qr: qr.map(str::to_string),
    })
}

pub fn disconnect_ok() -> Outcome<()> {
    Ok(ApiEnvelope {
        success: true,
        message: None,
        data: None,
    })
}

pub fn test_message_ok(message_id: &str) -> Outcome<TestMessageData> {
    envelope(TestMessageData {
        message_id: Some(message_id.to_string()),
    })
}

pub fn campaign_ok(
    id: &str,
    status: &str,
    total: u64,
    sent: u64,
    failed: u64,
) -> Outcome<CampaignStatusData> {
    let data = serde_json::from_value(json!({
        "bulkMessage": {
            "id": id,
            "status": status,
            "progress": {
                "total": total,
                "sent": sent,
                "failed": failed,
                "pending": total.saturating_sub(sent + failed)
            }
        }
    }))
    .expect("campaign fixture should deserialize");
    envelope(data)
}
