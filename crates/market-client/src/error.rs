//! Errors surfaced to callers of the API client

use reqwest::StatusCode;

/// Outcome of a failed `ApiClient::send`.
///
/// An expired access credential never shows up here when the refresh
/// succeeds; callers only see it as `Unauthorized` if the replayed request is
/// refused again, or as `RefreshRejected` when the session could not be renewed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No response: connection refused, timeout, broken body stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// 401 on a request that was already replayed once.
    #[error("unauthorized after credential refresh: {body}")]
    Unauthorized { body: String },

    /// The refresh credential was missing, expired or refused. The session has
    /// been torn down by the time a caller sees this.
    #[error("session refresh rejected: {0}")]
    RefreshRejected(String),

    /// Any other non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    /// The refresh task went away without settling this request.
    #[error("credential refresh abandoned")]
    RefreshAbandoned,

    #[error(transparent)]
    Auth(#[from] market_auth::Error),
}

impl ClientError {
    /// True for failures that end with the user needing to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ClientError::Unauthorized { .. }
                | ClientError::RefreshRejected(_)
                | ClientError::Auth(market_auth::Error::Rejected(_))
        )
    }

    /// HTTP status behind this error, when there was a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_login_covers_auth_failures_only() {
        assert!(ClientError::RefreshRejected("expired".into()).requires_login());
        assert!(ClientError::Unauthorized { body: String::new() }.requires_login());
        assert!(!ClientError::Transport("refused".into()).requires_login());
        assert!(
            !ClientError::Http {
                status: StatusCode::NOT_FOUND,
                body: String::new()
            }
            .requires_login()
        );
    }

    #[test]
    fn status_is_exposed_for_http_failures() {
        let err = ClientError::Http {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream".into(),
        };
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(err.to_string(), "HTTP 502 Bad Gateway: upstream");
        assert_eq!(ClientError::RefreshAbandoned.status(), None);
    }
}
