use pairlink_core::state::{ConnectionState, PairingCode, Phase};
use serde::{Deserialize, Serialize};

/// Response envelope shared by every backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Minimal shape used to pull `message` out of error bodies.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectData {
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub qr: Option<String>,
}

impl ConnectData {
    pub fn pairing_code(&self) -> Option<PairingCode> {
        self.qr.clone().and_then(PairingCode::new)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub qr: Option<String>,
}

impl StatusData {
    /// The status exactly as reported. The store normalises it on commit.
    ///
    /// A missing `state` falls back to the reported `isConnected` flag.
    pub fn to_proposal(&self) -> ConnectionState {
        let phase = match self.state.as_deref() {
            Some(state) => Phase::from_wire(state),
            None if self.is_connected => Phase::Open,
            None => Phase::NotConnected,
        };
        ConnectionState::reported(
            self.is_connected,
            phase,
            self.qr.clone().and_then(PairingCode::new),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrData {
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub qr: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessageRequest<'a> {
    pub phone_number: &'a str,
    pub message: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessageData {
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CampaignProgress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub pending: u64,
}

impl CampaignProgress {
    pub fn is_drained(&self) -> bool {
        self.total > 0 && self.sent + self.failed >= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub progress: CampaignProgress,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatusData {
    pub bulk_message: Campaign,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginData {
    pub user: LoginUser,
    pub token: String,
}
