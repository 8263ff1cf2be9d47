use bankfeed_core::Error;
use thiserror::Error as ThisError;

/// Failures inside the SQLite store. Converted into
/// [`bankfeed_core::Error::Storage`] at the `SecureStore` seam.
#[derive(Debug, ThisError)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::storage(err.to_string())
    }
}
