//! Error types for the connect crate.

use bankfeed_core::errors::{Error as CoreError, RetryClass};
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors raised while talking to an aggregator or the expense service.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transport failure: connect refused, timeout, broken body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the remote service.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or malformed credentials on our side.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ConnectError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) => RetryClass::Permanent,
            Self::InvalidRequest(_) => RetryClass::Permanent,
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }

    /// Maps a failure of the expense service. Unlike provider failures, an
    /// auth problem there says nothing about the bank connection, so it is
    /// reported as a (retryable) ledger error.
    pub fn into_ledger_error(self) -> CoreError {
        match self.retry_class() {
            RetryClass::Retryable | RetryClass::ReauthRequired => {
                CoreError::ledger(self.to_string())
            }
            RetryClass::Permanent => self.into_permanent(),
        }
    }

    fn into_permanent(self) -> CoreError {
        match self {
            Self::Api { .. } | Self::InvalidRequest(_) => {
                CoreError::invalid_argument(self.to_string())
            }
            other => CoreError::validation(other.to_string()),
        }
    }
}

/// Provider-side mapping used at the [`bankfeed_core::connections::BankProvider`] seam.
impl From<ConnectError> for CoreError {
    fn from(err: ConnectError) -> Self {
        match err.retry_class() {
            RetryClass::ReauthRequired => CoreError::auth_failed(err.to_string()),
            RetryClass::Retryable => CoreError::provider_unavailable(err.to_string()),
            RetryClass::Permanent => err.into_permanent(),
        }
    }
}
