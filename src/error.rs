//! Error types for LFS client operations.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for LFS client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during LFS operations.
///
/// Errors are `Clone` because a single failure is delivered to every
/// waiter of a deduplicated transfer.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The credential provider could not produce a credential
    #[error("failed to obtain credentials: {0}")]
    AuthFetch(String),

    /// Server answered 401
    #[error("{url} - 401 (unauthorized)")]
    Unauthorized { url: String },

    /// Server answered 403
    #[error("{url} - 403 (forbidden)")]
    Forbidden { url: String },

    /// Unexpected status code, or redirect/retry budget exhausted
    #[error("{url} - {status} (unexpected status)")]
    UnexpectedStatus { url: String, status: u16 },

    /// Malformed or inconsistent server response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Downloaded content does not match its declared oid or size
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Object not found on server
    #[error("object not found: {0}")]
    NotFound(String),

    /// Server reported a per-object error
    #[error("LFS server error: {message} (code: {code})")]
    Server { code: u16, message: String },

    /// The transfer was cancelled by the caller
    #[error("transfer cancelled")]
    Cancelled,

    /// The worker pool was shut down before the transfer completed
    #[error("worker pool is shut down")]
    Shutdown,

    /// HTTP transport failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// HTTP status code associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Unauthorized { .. } => Some(401),
            Error::Forbidden { .. } => Some(403),
            Error::UnexpectedStatus { status, .. } => Some(*status),
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Readers report integrity failures through io::Error; unwrap them.
        match err.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
            Some(inner) => inner.clone(),
            None => Error::Io(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => io::Error::new(inner.kind(), Error::Io(inner)),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
