//! The API client: augment, send, classify, recover

use std::sync::Arc;
use std::time::Duration;

use market_auth::{MemorySessionStore, Registration, Session, SessionStore};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use crate::augment::augment;
use crate::classify::{Classification, classify, settle};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::refresh::{DEFAULT_REFRESH_TIMEOUT, EndpointRefresher, RefreshCoordinator, TokenRefresher};
use crate::request::RequestDescriptor;
use crate::teardown::{ReauthSignal, SessionTeardown};
use crate::transport::{ApiResponse, HttpTransport, Transport};

/// Default per-request timeout for the HTTP transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    base_url: String,
    http: reqwest::Client,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
}

/// Authenticated client for the marketplace API.
///
/// Cheap to clone; clones share the session store and the refresh state, so
/// concurrent calls from any clone take part in the same single-flight refresh.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Send a request with the stored credential and settle the response.
    ///
    /// A first-attempt 401 is recovered transparently: the call suspends until
    /// the shared refresh settles and then resolves with its own replay.
    #[instrument(skip_all, fields(request_id = %request.id(), method = %request.method(), path = %request.path()))]
    pub async fn send(&self, mut request: RequestDescriptor) -> Result<ApiResponse> {
        augment(&mut request, self.inner.store.as_ref());

        let response = match self.inner.transport.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_request("transport_error");
                return Err(e);
            }
        };

        let classification = classify(response.status, request.is_retried());
        let result = match classification {
            Classification::AuthorizationExpired => {
                debug!("access credential expired, entering recovery");
                self.inner.coordinator.recover(request).await
            }
            other => settle(response, other),
        };

        metrics::record_request(outcome(&result));
        result
    }

    /// `send` and decode the JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestDescriptor) -> Result<T> {
        self.send(request).await?.json()
    }

    /// Sign in and store the resulting session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let session = market_auth::login(&self.inner.http, &self.inner.base_url, email, password).await?;
        self.inner.store.write(session.clone());
        info!(role = %session.role, store = self.inner.store.name(), "signed in");
        Ok(session)
    }

    /// Create an account. Does not sign in.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<serde_json::Value> {
        let registration = Registration {
            username,
            email,
            password,
        };
        Ok(market_auth::register(&self.inner.http, &self.inner.base_url, &registration).await?)
    }

    /// Forget the stored session. The backend keeps no server-side session to revoke.
    pub fn logout(&self) {
        self.inner.store.clear();
        info!(store = self.inner.store.name(), "signed out");
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.store.read()
    }

    /// Wait until session changes made so far have been persisted.
    pub async fn flush(&self) {
        self.inner.store.flush().await;
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Refresh state, for diagnostics and tests.
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }
}

fn outcome(result: &Result<ApiResponse>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(ClientError::Unauthorized { .. }) => "unauthorized",
        Err(ClientError::RefreshRejected(_)) => "refresh_rejected",
        Err(ClientError::Http { .. }) => "http_error",
        Err(ClientError::Transport(_)) => "transport_error",
        Err(_) => "error",
    }
}

/// Builder for `ApiClient`.
///
/// Everything except the base URL has a default: an in-memory store, a
/// signal that does nothing, the reqwest transport and the endpoint refresher.
pub struct ApiClientBuilder {
    base_url: String,
    http: Option<reqwest::Client>,
    store: Option<Arc<dyn SessionStore>>,
    signal: Option<Arc<dyn ReauthSignal>>,
    transport: Option<Arc<dyn Transport>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    timeout: Duration,
    refresh_timeout: Duration,
}

impl ApiClientBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: None,
            store: None,
            signal: None,
            transport: None,
            refresher: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Called once per teardown, after the session has been cleared.
    pub fn signal(mut self, signal: Arc<dyn ReauthSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound on one refresh call. Expiry counts as a rejected refresh.
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidRequest(format!(
                "base URL must start with http:// or https://, got {base_url:?}"
            )));
        }
        if self.timeout.is_zero() || self.refresh_timeout.is_zero() {
            return Err(ClientError::InvalidRequest("timeouts must be greater than zero".into()));
        }

        let http = match self.http {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| ClientError::Transport(format!("building HTTP client: {e}")))?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        let signal = self.signal.unwrap_or_else(|| Arc::new(|| {}));
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(HttpTransport::new(http.clone(), base_url.clone(), self.timeout))
        });
        let refresher = self
            .refresher
            .unwrap_or_else(|| Arc::new(EndpointRefresher::new(http.clone(), base_url.clone())));

        let teardown = SessionTeardown::new(store.clone(), signal);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            refresher,
            teardown,
            self.refresh_timeout,
        );

        debug!(%base_url, store = store.name(), "API client ready");
        Ok(ApiClient {
            inner: Arc::new(Inner {
                base_url,
                http,
                store,
                transport,
                coordinator,
            }),
        })
    }
}
