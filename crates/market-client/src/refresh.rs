//! Single-flight credential refresh with an ordered waiter queue
//!
//! Every request that comes back 401 on its first attempt is parked here
//! together with the channel its caller is waiting on. The first one to arrive
//! while no refresh is running flips the state to `Refreshing` and spawns the
//! refresh task; everyone else just joins the queue. When the refresh settles
//! the queue is drained in arrival order:
//!
//! - success: the new access credential is stored, the state goes back to
//!   `Idle`, and each parked request is replayed with it. Replays run
//!   concurrently but are dispatched in queue order, and each caller receives
//!   the result of its own replay.
//! - failure: the session is torn down once and every parked caller is
//!   rejected with `RefreshRejected`.
//!
//! The triggering request is queued like any other, so it is replayed (or
//! rejected) through the same path.
//!
//! The check-and-set of the phase happens under a `std::sync::Mutex` that is
//! never held across an await, which keeps the single-flight invariant on a
//! multi-threaded runtime. The refresh itself runs in a detached task so a
//! caller dropping its future cannot strand the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::Secret;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use market_auth::SessionStore;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::augment::set_bearer;
use crate::classify::{classify, settle};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::request::RequestDescriptor;
use crate::teardown::SessionTeardown;
use crate::transport::{ApiResponse, Transport};

/// Default bound on a single refresh call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Exchanges a refresh credential for a new access credential.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = market_auth::Result<String>> + Send + 'a>>;
}

/// Refresher that calls the marketplace refresh endpoint.
#[derive(Clone)]
pub struct EndpointRefresher {
    client: reqwest::Client,
    base_url: String,
}

impl EndpointRefresher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl TokenRefresher for EndpointRefresher {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = market_auth::Result<String>> + Send + 'a>> {
        Box::pin(market_auth::refresh_access(
            &self.client,
            &self.base_url,
            refresh,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Refreshing,
}

/// A caller suspended until the refresh settles.
struct Pending {
    request: RequestDescriptor,
    completion: oneshot::Sender<Result<ApiResponse>>,
}

struct RefreshState {
    phase: Phase,
    waiters: VecDeque<Pending>,
}

/// How a recoverable request gets admitted.
enum Admission {
    /// A refresh already finished while this request was in flight.
    Replay(RequestDescriptor, String),
    /// Parked in the queue; `lead` means this caller started the refresh.
    Queued { lead: bool, position: usize },
}

struct Inner {
    state: Mutex<RefreshState>,
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn TokenRefresher>,
    teardown: SessionTeardown,
    refresh_timeout: Duration,
    refresh_calls: AtomicU64,
}

/// Coordinates access-credential refresh for one client instance.
///
/// Cloning shares the same state; the client and its spawned refresh task
/// both hold one.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn TokenRefresher>,
        teardown: SessionTeardown,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState {
                    phase: Phase::Idle,
                    waiters: VecDeque::new(),
                }),
                store,
                transport,
                refresher,
                teardown,
                refresh_timeout,
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Recover a request whose first attempt came back 401.
    ///
    /// The request is marked retried, so its replay can never come back here.
    /// Resolves with the replay's result, or `RefreshRejected` when the
    /// session could not be renewed. Must be called from within a tokio runtime.
    pub async fn recover(&self, mut request: RequestDescriptor) -> Result<ApiResponse> {
        request.mark_retried();
        let (completion, receiver) = oneshot::channel();

        let admission = {
            let mut state = self.inner.lock_state();
            match self.inner.newer_access(&state, &request) {
                Some(access) => Admission::Replay(request, access),
                None => {
                    let lead = state.phase == Phase::Idle;
                    state.phase = Phase::Refreshing;
                    state.waiters.push_back(Pending {
                        request,
                        completion,
                    });
                    Admission::Queued {
                        lead,
                        position: state.waiters.len(),
                    }
                }
            }
        };

        match admission {
            Admission::Replay(mut request, access) => {
                debug!(request_id = %request.id(), "credential already refreshed, replaying");
                set_bearer(&mut request, &access);
                self.inner.replay(&request).await
            }
            Admission::Queued { lead, position } => {
                if lead {
                    debug!("starting credential refresh");
                    tokio::spawn(self.inner.clone().run_refresh());
                } else {
                    debug!(position, "refresh in progress, waiting");
                }
                receiver.await.unwrap_or(Err(ClientError::RefreshAbandoned))
            }
        }
    }

    /// True while a refresh call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().phase == Phase::Refreshing
    }

    /// Number of callers currently parked.
    pub fn waiting(&self) -> usize {
        self.inner.lock_state().waiters.len()
    }

    /// Refresh calls issued by this coordinator so far.
    pub fn refresh_calls(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::Relaxed)
    }

    /// Teardowns performed after failed refreshes.
    pub fn teardowns(&self) -> u64 {
        self.inner.teardown.runs()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While idle, a 401 for a credential that has since been replaced only
    /// needs a replay, not another refresh.
    fn newer_access(&self, state: &RefreshState, request: &RequestDescriptor) -> Option<String> {
        if state.phase != Phase::Idle {
            return None;
        }
        let session = self.store.read()?;
        let current = session.access_token();
        if current.is_empty() || request.bearer() == Some(current) {
            return None;
        }
        Some(current.to_owned())
    }

    async fn run_refresh(self: Arc<Self>) {
        let started = Instant::now();
        let outcome = self.refresh_once().await;

        match outcome {
            Ok(access) => {
                let drained = self.release();
                metrics::record_refresh("success");
                info!(
                    waiters = drained.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "credential refreshed, replaying queued requests"
                );
                self.replay_all(drained, access.expose()).await;
            }
            Err(reason) => {
                // Clear the session before going idle so a request arriving
                // right after cannot start a refresh with the rejected credential.
                self.teardown.run(&reason);
                let drained = self.release();
                metrics::record_refresh("rejected");
                warn!(
                    waiters = drained.len(),
                    reason = %reason,
                    "credential refresh failed, rejecting queued requests"
                );
                for pending in drained {
                    let _ = pending
                        .completion
                        .send(Err(ClientError::RefreshRejected(reason.clone())));
                }
            }
        }
    }

    /// Perform exactly one refresh call, bounded by `refresh_timeout`.
    async fn refresh_once(&self) -> std::result::Result<Secret<String>, String> {
        let refresh: Secret<String> = self
            .store
            .read()
            .and_then(|session| session.refresh_token().map(Secret::from))
            .ok_or_else(|| String::from("no refresh credential"))?;

        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        let call = self.refresher.refresh(refresh.expose());
        match tokio::time::timeout(self.refresh_timeout, call).await {
            Ok(Ok(access)) => {
                self.store.set_access(access.clone());
                Ok(Secret::new(access))
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "refresh timed out after {:?}",
                self.refresh_timeout
            )),
        }
    }

    /// Go back to idle and take every parked caller, oldest first.
    fn release(&self) -> Vec<Pending> {
        let mut state = self.lock_state();
        state.phase = Phase::Idle;
        state.waiters.drain(..).collect()
    }

    /// Replay drained requests with the new credential.
    ///
    /// `FuturesUnordered` polls newly pushed futures in insertion order, so
    /// each replay is dispatched in queue order; completions may then finish
    /// in any order.
    async fn replay_all(&self, drained: Vec<Pending>, access: &str) {
        let mut replays = FuturesUnordered::new();

        for Pending {
            mut request,
            completion,
        } in drained
        {
            if completion.is_closed() {
                debug!(request_id = %request.id(), "caller gone, skipping replay");
                continue;
            }
            set_bearer(&mut request, access);
            replays.push(async move {
                let result = self.replay(&request).await;
                let _ = completion.send(result);
            });
        }

        while replays.next().await.is_some() {}
    }

    /// Send a request that has already been retried once and settle it.
    async fn replay(&self, request: &RequestDescriptor) -> Result<ApiResponse> {
        metrics::record_replay();
        debug!(request_id = %request.id(), method = %request.method(), path = %request.path(), "replaying request");
        let response = self.transport.execute(request).await?;
        let classification = classify(response.status, request.is_retried());
        settle(response, classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use market_auth::{MemorySessionStore, Role, Session};
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Transport that records dispatch order and the bearer each request carried.
    ///
    /// Answers 200 when the bearer matches `valid`, 401 otherwise.
    struct ScriptedTransport {
        valid: Mutex<String>,
        log: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedTransport {
        fn new(valid: &str) -> Arc<Self> {
            Arc::new(Self {
                valid: Mutex::new(valid.to_string()),
                log: Mutex::new(Vec::new()),
            })
        }

        fn log(&self) -> Vec<(String, Option<String>)> {
            self.log.lock().unwrap().clone()
        }

        fn set_valid(&self, token: &str) {
            *self.valid.lock().unwrap() = token.to_string();
        }
    }

    impl Transport for ScriptedTransport {
        fn execute<'a>(
            &'a self,
            request: &'a RequestDescriptor,
        ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
            Box::pin(async move {
                let bearer = request.bearer().map(str::to_owned);
                self.log
                    .lock()
                    .unwrap()
                    .push((request.path().to_string(), bearer.clone()));
                let ok = bearer.as_deref() == Some(self.valid.lock().unwrap().as_str());
                let (status, body) = if ok {
                    (StatusCode::OK, format!("ok {}", request.path()))
                } else {
                    (StatusCode::UNAUTHORIZED, "expired".to_string())
                };
                Ok(ApiResponse {
                    status,
                    headers: HeaderMap::new(),
                    body: Bytes::from(body),
                })
            })
        }
    }

    /// Refresher that blocks until released, then answers with a fixed result.
    struct GatedRefresher {
        gate: Notify,
        result: std::result::Result<String, String>,
        calls: AtomicUsize,
    }

    impl GatedRefresher {
        fn new(result: std::result::Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                result: result.map(str::to_owned).map_err(str::to_owned),
                calls: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.gate.notify_one();
        }
    }

    impl TokenRefresher for GatedRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh: &'a str,
        ) -> Pin<Box<dyn Future<Output = market_auth::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                self.result
                    .clone()
                    .map_err(market_auth::Error::Rejected)
            })
        }
    }

    struct Harness {
        coordinator: RefreshCoordinator,
        store: Arc<MemorySessionStore>,
        transport: Arc<ScriptedTransport>,
        refresher: Arc<GatedRefresher>,
        signals: Arc<AtomicUsize>,
    }

    fn harness(session: Option<Session>, refresher: Arc<GatedRefresher>) -> Harness {
        let store = Arc::new(match session {
            Some(s) => MemorySessionStore::with_session(s),
            None => MemorySessionStore::new(),
        });
        let transport = ScriptedTransport::new("T2");
        let signals = Arc::new(AtomicUsize::new(0));
        let counter = signals.clone();
        let teardown = SessionTeardown::new(
            store.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            refresher.clone(),
            teardown,
            Duration::from_secs(5),
        );
        Harness {
            coordinator,
            store,
            transport,
            refresher,
            signals,
        }
    }

    fn expired_request(path: &str) -> RequestDescriptor {
        let mut request = RequestDescriptor::get(path);
        set_bearer(&mut request, "T1");
        request
    }

    /// Let spawned tasks run until `cond` holds.
    async fn settle_until(cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn burst_triggers_one_refresh_and_replays_in_order() {
        let h = harness(
            Some(Session::new("T1", "R1", Role::Buyer)),
            GatedRefresher::new(Ok("T2")),
        );

        let mut handles = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.recover(expired_request(path)).await
            }));
            // park each caller before spawning the next so arrival order is fixed
            let expected = handles.len();
            settle_until(|| h.coordinator.waiting() == expected).await;
        }

        assert!(h.coordinator.is_refreshing());
        h.refresher.open();

        for (handle, path) in handles.into_iter().zip(["/a", "/b", "/c"]) {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.text(), format!("ok {path}"));
        }

        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.refresh_calls(), 1);
        assert_eq!(
            h.transport.log(),
            vec![
                ("/a".to_string(), Some("T2".to_string())),
                ("/b".to_string(), Some("T2".to_string())),
                ("/c".to_string(), Some("T2".to_string())),
            ]
        );
        assert_eq!(h.store.read().unwrap().access_token(), "T2");
        assert!(!h.coordinator.is_refreshing());
        assert_eq!(h.coordinator.waiting(), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_tears_down_once_for_all_waiters() {
        let h = harness(
            Some(Session::new("T1", "R1", Role::Seller)),
            GatedRefresher::new(Err("refresh token expired")),
        );

        let mut handles = Vec::new();
        for i in 0..5 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .recover(expired_request(&format!("/products/{i}")))
                    .await
            }));
        }
        settle_until(|| h.coordinator.waiting() == 5).await;
        h.refresher.open();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ClientError::RefreshRejected(_)), "got {err:?}");
        }

        assert!(h.store.read().is_none());
        assert_eq!(h.signals.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.teardowns(), 1);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert!(h.transport.log().is_empty(), "nothing may be replayed");
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn missing_refresh_credential_tears_down_without_calling_endpoint() {
        let h = harness(
            Some(Session::new("T1", "", Role::Buyer)),
            GatedRefresher::new(Ok("T2")),
        );

        let err = h
            .coordinator
            .recover(expired_request("/users/me"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::RefreshRejected(_)));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.signals.load(Ordering::SeqCst), 1);
        assert!(h.store.read().is_none());
    }

    #[tokio::test]
    async fn replay_refused_again_is_unauthorized() {
        let h = harness(
            Some(Session::new("T1", "R1", Role::Buyer)),
            GatedRefresher::new(Ok("T2")),
        );
        // the server rejects even the fresh credential
        h.transport.set_valid("never");

        let coordinator = h.coordinator.clone();
        let handle =
            tokio::spawn(async move { coordinator.recover(expired_request("/a")).await });
        settle_until(|| h.coordinator.waiting() == 1).await;
        h.refresher.open();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized { .. }), "got {err:?}");
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.log().len(), 1);
        assert_eq!(h.signals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_credential_replays_without_refresh() {
        // a refresh already replaced T1 with T2 while this request was in flight
        let h = harness(
            Some(Session::new("T2", "R1", Role::Buyer)),
            GatedRefresher::new(Ok("T3")),
        );

        let response = h
            .coordinator
            .recover(expired_request("/late"))
            .await
            .unwrap();

        assert_eq!(response.text(), "ok /late");
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.transport.log(),
            vec![("/late".to_string(), Some("T2".to_string()))]
        );
    }

    #[tokio::test]
    async fn refresh_timeout_tears_down() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            "T1",
            "R1",
            Role::Buyer,
        )));
        let signals = Arc::new(AtomicUsize::new(0));
        let counter = signals.clone();
        let refresher = GatedRefresher::new(Ok("T2"));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            ScriptedTransport::new("T2"),
            refresher.clone(),
            SessionTeardown::new(
                store.clone(),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ),
            Duration::from_millis(50),
        );

        // the gate is never opened: the refresh hangs until the timeout
        let err = coordinator
            .recover(expired_request("/hung"))
            .await
            .unwrap_err();

        match err {
            ClientError::RefreshRejected(reason) => {
                assert!(reason.contains("timed out"), "got {reason}")
            }
            other => panic!("expected RefreshRejected, got {other:?}"),
        }
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        assert!(store.read().is_none());
        assert!(!coordinator.is_refreshing());
    }

    /// Transport that holds every request until released, then answers 401.
    struct HeldTransport {
        release: Notify,
        arrived: AtomicUsize,
    }

    impl Transport for HeldTransport {
        fn execute<'a>(
            &'a self,
            _request: &'a RequestDescriptor,
        ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
            Box::pin(async move {
                self.arrived.fetch_add(1, Ordering::SeqCst);
                self.release.notified().await;
                Ok(ApiResponse {
                    status: StatusCode::UNAUTHORIZED,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"expired"),
                })
            })
        }
    }

    #[tokio::test]
    async fn replay_refused_during_next_refresh_is_not_queued_again() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            "T1",
            "R1",
            Role::Buyer,
        )));
        let transport = Arc::new(HeldTransport {
            release: Notify::new(),
            arrived: AtomicUsize::new(0),
        });
        let refresher = GatedRefresher::new(Ok("T2"));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            refresher.clone(),
            SessionTeardown::new(store.clone(), Arc::new(|| {})),
            Duration::from_secs(5),
        );

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.recover(expired_request("/a")).await })
        };
        settle_until(|| coordinator.waiting() == 1 && refresher.calls.load(Ordering::SeqCst) == 1)
            .await;
        refresher.open();

        // the replay of /a is now in flight and held by the transport
        settle_until(|| transport.arrived.load(Ordering::SeqCst) == 1).await;

        // /b was refused with the new credential and starts a second refresh,
        // which stays gated for the rest of the test
        let mut late = RequestDescriptor::get("/b");
        set_bearer(&mut late, "T2");
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.recover(late).await })
        };
        settle_until(|| coordinator.waiting() == 1 && refresher.calls.load(Ordering::SeqCst) == 2)
            .await;

        transport.release.notify_one();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized { .. }), "got {err:?}");

        // /a did not join the refresh in progress or start another one
        assert!(coordinator.is_refreshing());
        assert_eq!(coordinator.waiting(), 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.arrived.load(Ordering::SeqCst), 1);

        second.abort();
    }

    #[tokio::test]
    async fn dropped_caller_does_not_strand_the_queue() {
        let h = harness(
            Some(Session::new("T1", "R1", Role::Buyer)),
            GatedRefresher::new(Ok("T2")),
        );

        let coordinator = h.coordinator.clone();
        let leader =
            tokio::spawn(async move { coordinator.recover(expired_request("/gone")).await });
        settle_until(|| h.coordinator.waiting() == 1).await;
        leader.abort();
        let _ = leader.await;

        let coordinator = h.coordinator.clone();
        let follower =
            tokio::spawn(async move { coordinator.recover(expired_request("/stays")).await });
        settle_until(|| h.coordinator.waiting() == 2).await;
        h.refresher.open();

        let response = follower.await.unwrap().unwrap();
        assert_eq!(response.text(), "ok /stays");
        assert!(!h.coordinator.is_refreshing());
        // the abandoned request is not replayed
        assert_eq!(
            h.transport.log(),
            vec![("/stays".to_string(), Some("T2".to_string()))]
        );
    }
}
