//! Bearer credential injection for outgoing requests

use market_auth::SessionStore;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::warn;

use crate::request::RequestDescriptor;

/// Attach the stored access credential, if there is one.
///
/// Without a session the request goes out unauthenticated; whether that is
/// acceptable is the endpoint's decision, not ours.
pub fn augment(request: &mut RequestDescriptor, store: &dyn SessionStore) {
    if let Some(session) = store.read() {
        set_bearer(request, session.access_token());
    }
}

/// Replace the `Authorization` header with `Bearer <access>`.
///
/// A credential that cannot be a header value is dropped with a warning and
/// the request is left without one; the server's 401 then drives recovery.
pub fn set_bearer(request: &mut RequestDescriptor, access: &str) {
    let value = HeaderValue::from_str(&format!("Bearer {access}"));
    request.headers_mut().remove(AUTHORIZATION);

    match value {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(e) => {
            warn!(request_id = %request.id(), error = %e, "access credential is not a valid header value");
        }
    }
}
