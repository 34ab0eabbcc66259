//! Common error types for SnapVault.

use thiserror::Error;

/// Top-level error type for SnapVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The password verifier could not be opened.
    ///
    /// Reported identically for a wrong password, a corrupted verifier and a
    /// truncated nonce so callers cannot tell them apart.
    #[error("Wrong password")]
    WrongPassword,

    /// No usable key exists for the requested scope.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A cryptographic primitive rejected its input.
    #[error("Cryptographic error: {0}")]
    Primitive(String),

    /// A network or object storage leg failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local or remote store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether re-running the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
