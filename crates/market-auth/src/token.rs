//! Login, registration and access-credential refresh
//!
//! Three endpoint interactions, all against the marketplace API:
//! 1. Password login (produces the initial `Session`)
//! 2. Account registration
//! 3. Access-credential refresh (used by the client's refresh coordinator)
//!
//! None of these go through the authenticated client: they either run before
//! a session exists or are the mechanism that renews it.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::constants::{LOGIN_PATH, REFRESH_PATH, REGISTER_PATH, endpoint};
use crate::error::{Error, Result};
use crate::session::{Role, Session};

/// Response from the login endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl LoginResponse {
    /// Build the session this login produced. A missing role means buyer.
    pub fn into_session(self) -> Session {
        Session::new(
            self.access_token,
            self.refresh_token.unwrap_or_default(),
            self.role.unwrap_or_default(),
        )
    }
}

/// Response from the refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// New account details for the register endpoint.
#[derive(Debug, Serialize)]
pub struct Registration<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

/// Exchange email + password for a session.
#[instrument(skip(client, password), fields(email = %email))]
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    email: &str,
    password: &str,
) -> Result<Session> {
    let response = client
        .post(endpoint(base_url, LOGIN_PATH))
        .form(&[("email", email), ("password", password)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let response = check_status(response, "login").await?;
    let login = response
        .json::<LoginResponse>()
        .await
        .map_err(|e| Error::Decode(format!("invalid login response: {e}")))?;

    if login.access_token.is_empty() {
        return Err(Error::Decode("login response has empty access_token".into()));
    }

    let session = login.into_session();
    debug!(role = %session.role, has_refresh = session.refresh_token().is_some(), "login succeeded");
    Ok(session)
}

/// Create a new account. Returns the user record the backend echoes back.
#[instrument(skip(client, registration), fields(email = %registration.email))]
pub async fn register(
    client: &reqwest::Client,
    base_url: &str,
    registration: &Registration<'_>,
) -> Result<serde_json::Value> {
    let response = client
        .post(endpoint(base_url, REGISTER_PATH))
        .json(registration)
        .send()
        .await
        .map_err(|e| Error::Http(format!("register request failed: {e}")))?;

    let response = check_status(response, "register").await?;
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| Error::Decode(format!("invalid register response: {e}")))
}

/// Obtain a new access credential using the refresh credential.
///
/// 401/403 map to `Error::Rejected`: the refresh credential is expired or
/// revoked and the session cannot be recovered. A success response without an
/// `access_token` is a decode error.
#[instrument(skip_all)]
pub async fn refresh_access(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<String> {
    let response = client
        .post(endpoint(base_url, REFRESH_PATH))
        .form(&[("refresh_token", refresh)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("refresh request failed: {e}")))?;

    let response = check_status(response, "refresh").await?;
    let body = response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| Error::Decode(format!("invalid refresh response: {e}")))?;

    match body.access_token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(Error::Decode("no access token returned".into())),
    }
}

/// Map non-success statuses to errors, keeping the body for context.
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::Rejected(format!("{what} returned {status}: {body}")));
    }
    Err(Error::Endpoint(format!("{what} returned {status}: {body}")))
}
