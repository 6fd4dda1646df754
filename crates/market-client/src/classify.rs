//! Response classification
//!
//! Decides, from the status alone, whether a response is delivered to the
//! caller, recovered through a credential refresh, or turned into an error.
//! Only a first-attempt 401 is recoverable; a 401 on a replay is final so a
//! server that keeps refusing fresh credentials cannot loop us.

use reqwest::StatusCode;

use crate::error::{ClientError, Result};
use crate::transport::ApiResponse;

/// What to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Deliver to the caller
    Success,
    /// Expired or invalid access credential on a first attempt: refresh and replay
    AuthorizationExpired,
    /// 401 on a request that was already replayed once
    AuthorizationExpiredRepeat,
    /// Any other failure status, passed through unchanged
    HttpError,
}

/// Classify a response status for a request with the given retry mark.
pub fn classify(status: StatusCode, retried: bool) -> Classification {
    match status {
        StatusCode::UNAUTHORIZED if retried => Classification::AuthorizationExpiredRepeat,
        StatusCode::UNAUTHORIZED => Classification::AuthorizationExpired,
        s if s.is_success() || s.is_redirection() || s.is_informational() => {
            Classification::Success
        }
        _ => Classification::HttpError,
    }
}

/// Turn a response into the caller-facing result.
///
/// `AuthorizationExpired` is only passed here by paths that chose not to
/// recover, so it is reported the same way as a repeat.
pub fn settle(response: ApiResponse, classification: Classification) -> Result<ApiResponse> {
    match classification {
        Classification::Success => Ok(response),
        Classification::AuthorizationExpired | Classification::AuthorizationExpiredRepeat => {
            Err(ClientError::Unauthorized {
                body: response.text(),
            })
        }
        Classification::HttpError => Err(ClientError::Http {
            status: response.status,
            body: response.text(),
        }),
    }
}
