//! Error types for session storage and auth endpoint calls

/// Errors from auth endpoint calls and session persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The endpoint refused the presented credentials (401/403).
    #[error("credentials rejected: {0}")]
    Rejected(String),

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("session parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
