use pairlink_api::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The credential was rejected. It has already been cleared and
    /// `NotConnected` committed.
    #[error("credential rejected; please log in again")]
    Unauthorized,

    /// Any other failure. The store was left untouched.
    #[error("status fetch failed: {0}")]
    Api(ApiError),
}

impl FetchError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<ApiError> for FetchError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => Self::Unauthorized,
            other => Self::Api(other),
        }
    }
}
