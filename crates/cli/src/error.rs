use pairlink_api::ApiError;
use pairlink_core::config::ConfigError;
use pairlink_core::credential::CredentialError;
use pairlink_core::error::EventBusError;
use pairlink_push::PushError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("backend error: {0}")]
    Api(#[from] ApiError),

    #[error("push channel error: {0}")]
    Push(#[from] PushError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not logged in; run `pairlink login` first")]
    NotLoggedIn,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },
}
