//! Error types for the credential store.

use thiserror::Error;

/// Errors raised by a backend adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another user already holds this email (case-insensitive).
    #[error("email already registered")]
    DuplicateEmail,

    /// Disk error on the users file.
    #[error("users file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A record could not be encoded for writing.
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A blocking worker (file I/O or password hashing) panicked or was cancelled.
    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The password hash for a new record could not be computed.
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Errors visible to callers of [`crate::CredentialService`]. Anything that
/// is not the caller's fault ends up in `StoreUnavailable`.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A required field is missing or empty.
    #[error("{0}")]
    Validation(String),

    #[error("an account with this email already exists")]
    DuplicateEmail,

    /// Unknown email or wrong password; the two are deliberately indistinguishable.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("credential store unavailable")]
    StoreUnavailable(#[source] StoreError),
}

impl CredentialError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<StoreError> for CredentialError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => Self::DuplicateEmail,
            other => Self::StoreUnavailable(other),
        }
    }
}

/// Result type for service operations.
pub type CredentialResult<T> = Result<T, CredentialError>;
