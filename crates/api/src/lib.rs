pub mod client;
pub mod error;
pub mod wire;

pub use client::{HttpSessionApi, SessionApi};
pub use error::ApiError;
pub use wire::{
    ApiEnvelope, Campaign, CampaignProgress, CampaignStatus, CampaignStatusData, ConnectData,
    LoginData, QrData, StatusData, TestMessageData,
};
