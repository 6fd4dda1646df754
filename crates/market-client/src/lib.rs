//! Authenticated HTTP client for the marketplace API
//!
//! Request lifecycle:
//! 1. `augment` attaches `Authorization: Bearer <access>` from the session store
//! 2. `Transport::execute` sends it and reads the full response
//! 3. `classify` sorts the status into success, recoverable expiry, repeat
//!    expiry or plain HTTP error
//! 4. A recoverable expiry goes to the `RefreshCoordinator`: one refresh call
//!    no matter how many requests expired together, then every parked request
//!    is replayed once in arrival order with the new credential
//! 5. A failed refresh runs `SessionTeardown` once and rejects every parked request
//!
//! Callers never see the intermediate 401.

pub mod augment;
pub mod classify;
pub mod client;
pub mod error;
pub mod metrics;
pub mod refresh;
pub mod request;
pub mod teardown;
pub mod transport;

pub use classify::Classification;
pub use client::{ApiClient, ApiClientBuilder, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ClientError, Result};
pub use refresh::{DEFAULT_REFRESH_TIMEOUT, EndpointRefresher, RefreshCoordinator, TokenRefresher};
pub use request::RequestDescriptor;
pub use teardown::{ReauthSignal, SessionTeardown};
pub use transport::{ApiResponse, HttpTransport, Transport};
