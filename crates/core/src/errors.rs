//! Error types shared by the banking engine and its collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy class for a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors surfaced by the engine, providers, stores and the expense ledger.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad credentials, expired consent or a revoked token.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Transient transport failure, timeout or provider 5xx.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Malformed payload received from a collaborator.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller passed an unknown id or an out-of-range value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state (e.g. illegal status transition).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Secure store or repository failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Expense ledger failure.
    #[error("Expense ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger(message.into())
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::AuthFailed(_) => RetryClass::ReauthRequired,
            Self::ProviderUnavailable(_) | Self::Storage(_) | Self::Ledger(_) => {
                RetryClass::Retryable
            }
            Self::Validation(_)
            | Self::InvalidArgument(_)
            | Self::InvalidState(_)
            | Self::Serialization(_) => RetryClass::Permanent,
        }
    }

    /// True for programmer errors that public operations return to their caller.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::InvalidState(_))
    }
}
