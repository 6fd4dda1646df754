//! Session teardown and the host re-authentication hook

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use market_auth::SessionStore;
use tracing::warn;

use crate::metrics;

/// Host-provided "force re-authentication" operation.
///
/// A desktop or web host navigates to its sign-in screen; the CLI prints a
/// hint. Any `Fn() + Send + Sync` closure works.
pub trait ReauthSignal: Send + Sync {
    fn force_reauthentication(&self);
}

impl<F: Fn() + Send + Sync> ReauthSignal for F {
    fn force_reauthentication(&self) {
        self()
    }
}

/// Clears the session and tells the host to sign the user in again.
///
/// Safe to run repeatedly and concurrently: clearing an empty store is a
/// no-op. The refresh coordinator runs it once per failed refresh.
pub struct SessionTeardown {
    store: Arc<dyn SessionStore>,
    signal: Arc<dyn ReauthSignal>,
    runs: AtomicU64,
}

impl SessionTeardown {
    pub fn new(store: Arc<dyn SessionStore>, signal: Arc<dyn ReauthSignal>) -> Self {
        Self {
            store,
            signal,
            runs: AtomicU64::new(0),
        }
    }

    pub fn run(&self, reason: &str) {
        self.store.clear();
        self.runs.fetch_add(1, Ordering::Relaxed);
        metrics::record_teardown();
        warn!(reason, store = self.store.name(), "session torn down, re-authentication required");
        self.signal.force_reauthentication();
    }

    /// Number of teardowns performed by this instance.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}
