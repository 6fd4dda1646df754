//! Marketplace authentication library
//!
//! Owns the session data model and the calls that produce or renew it. This
//! crate has no knowledge of request replay or refresh coordination; the
//! client crate builds those on top.
//!
//! Session flow:
//! 1. `token::login()` exchanges email + password for a `Session`
//! 2. The session is written to a `store::SessionStore`
//! 3. On expiry the client calls `token::refresh_access()` with the refresh credential
//! 4. The new access credential replaces the old one via `SessionStore::set_access()`
//! 5. Logout or refresh failure calls `SessionStore::clear()`

pub mod constants;
pub mod error;
pub mod session;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use session::{Role, Session};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use token::{LoginResponse, RefreshResponse, Registration, login, refresh_access, register};
