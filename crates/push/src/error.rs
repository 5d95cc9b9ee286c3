use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("invalid push URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl PushError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PushError::AuthenticationFailed(_) | PushError::InvalidUrl { .. }
        )
    }
}
