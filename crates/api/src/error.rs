use thiserror::Error;

/// Failure of a single backend call.
///
/// `Clone` so that one in-flight result can be handed to every caller that
/// joined the same request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("credential rejected by backend")]
    Unauthorized,

    #[error("bad request: {message}")]
    BadRequest { message: String },

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("backend error (status {status})")]
    Server { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("invalid base URL {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },
}

impl ApiError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Failures that say nothing about the session and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Timeout | Self::Network(_))
    }

    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }

    pub(crate) fn from_status(status: u16, message: Option<String>) -> Self {
        match status {
            401 => Self::Unauthorized,
            400 => Self::BadRequest {
                message: message.unwrap_or_else(|| "bad request".to_string()),
            },
            500..=599 => Self::Server { status },
            _ => Self::Rejected {
                status,
                message: message.unwrap_or_default(),
            },
        }
    }
}
