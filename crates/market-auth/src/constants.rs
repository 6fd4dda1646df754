//! Marketplace API endpoint paths
//!
//! Paths are joined onto the configured base URL. The auth routes live under
//! `/users` on the marketplace backend.

/// Default API base URL for a locally running backend
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Password login, form-encoded `email` + `password`
pub const LOGIN_PATH: &str = "/users/login";

/// Access-credential refresh, form-encoded `refresh_token`
pub const REFRESH_PATH: &str = "/users/refresh";

/// Account creation, JSON body
pub const REGISTER_PATH: &str = "/users/register";

/// Profile of the authenticated user
pub const ME_PATH: &str = "/users/me";

/// Join an endpoint path onto a base URL without doubling the slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
