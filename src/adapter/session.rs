//! Continuation-passing adapter over a [`SessionBackend`]
//!
//! Every submitted request runs on its own tokio task and completes by
//! invoking the caller's continuation exactly once. The continuation is kept
//! in a pending map; whoever removes it from the map (the completing task or
//! [`SessionAdapter::shutdown`] or [`SessionAdapter::abandon`]) is the one
//! that invokes it. Identical concurrent searches share one backend call and
//! one [`SearchResult`].

use crate::adapter::request::{
    AdapterRequest, AdapterResponse, Continuation, Operation, ResponseData,
};
use crate::backend::{BackendError, BackendResultCode, SessionBackend};
use crate::error::{ErrorKind, Failure};
use crate::metrics::MetricsCollector;
use crate::types::{
    Attributes, RequestId, SearchQuery, SearchResult, SessionDescriptor, SessionId, SessionRoster,
};
use crate::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Map a backend result code onto the failure taxonomy
pub fn classify(code: BackendResultCode) -> ErrorKind {
    match code {
        BackendResultCode::NoConnection | BackendResultCode::TimedOut => {
            ErrorKind::NetworkUnavailable
        }
        BackendResultCode::NotFound => ErrorKind::NotFound,
        BackendResultCode::SessionFull => ErrorKind::Full,
        BackendResultCode::InvalidUser | BackendResultCode::NoPermission => {
            ErrorKind::PermissionDenied
        }
        BackendResultCode::InvalidParameters
        | BackendResultCode::AlreadyPending
        | BackendResultCode::UnexpectedError => ErrorKind::BackendError,
    }
}

impl From<BackendError> for Failure {
    fn from(error: BackendError) -> Self {
        Failure::with_diagnostic(classify(error.code), error.to_string())
    }
}

/// One backend search call and the requests waiting on it
struct InFlightSearch {
    /// Request whose task makes the backend call
    leader: RequestId,
    waiters: Vec<RequestId>,
}

#[derive(Default)]
struct AdapterState {
    shut_down: bool,
    pending: HashMap<RequestId, Continuation>,
    searches: HashMap<SearchQuery, InFlightSearch>,
    tasks: HashMap<RequestId, AbortHandle>,
}

/// Session backend adapter
#[derive(Clone)]
pub struct SessionAdapter {
    backend: Arc<dyn SessionBackend>,
    state: Arc<Mutex<AdapterState>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SessionAdapter {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(AdapterState::default())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Invalidation notices from the backend, if it publishes any
    pub fn invalidations(&self) -> Option<broadcast::Receiver<SessionId>> {
        self.backend.invalidations()
    }

    pub fn roster_updates(&self) -> Option<broadcast::Receiver<SessionRoster>> {
        self.backend.roster_updates()
    }

    /// Submit a request; `continuation` runs exactly once with its response.
    ///
    /// After [`shutdown`](Self::shutdown) the continuation runs synchronously
    /// with a `Cancelled` failure before this returns.
    pub fn submit(&self, request: AdapterRequest, continuation: Continuation) {
        let request_id = request.request_id;
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!("Adapter state lock poisoned, cancelling request {}", request_id);
                continuation(AdapterResponse::cancelled(request_id));
                return;
            }
        };

        if state.shut_down {
            drop(state);
            debug!("Adapter shut down, cancelling request {}", request_id);
            continuation(AdapterResponse::cancelled(request_id));
            return;
        }

        state.pending.insert(request_id, continuation);

        if let Operation::Search(query) = &request.operation {
            if let Some(search) = state.searches.get_mut(query) {
                search.waiters.push(request_id);
                debug!(
                    "Search {} joined in-flight search {} ({} waiting)",
                    request_id,
                    search.leader,
                    search.waiters.len()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_search_deduplicated();
                }
                return;
            }
            state.searches.insert(
                query.clone(),
                InFlightSearch {
                    leader: request_id,
                    waiters: vec![request_id],
                },
            );
        }

        debug!(
            "Dispatching {} request {}",
            request.operation.name(),
            request_id
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_request(request.operation.name());
        }

        let adapter = self.clone();
        let task = tokio::spawn(async move { adapter.execute(request).await });
        state.tasks.insert(request_id, task.abort_handle());
    }

    async fn execute(&self, request: AdapterRequest) {
        let request_id = request.request_id;
        match request.operation {
            Operation::Create {
                attributes,
                capacity,
            } => {
                let outcome = self
                    .backend
                    .create_session(attributes, capacity)
                    .await
                    .map(ResponseData::Created)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::Search(query) => {
                let started = Instant::now();
                let outcome = self
                    .backend
                    .find_sessions(&query.filters, query.max_results)
                    .await;
                if let Some(metrics) = &self.metrics {
                    metrics.record_search_duration(started.elapsed());
                }
                self.complete_search(request_id, query, outcome);
            }
            Operation::Join(session_id) => {
                let outcome = self
                    .backend
                    .join_session(&session_id)
                    .await
                    .map(ResponseData::Joined)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::Leave(session_id) => {
                let outcome = self
                    .backend
                    .leave_session(&session_id)
                    .await
                    .map(|_| ResponseData::Left)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::UpdateAttributes {
                session_id,
                attributes,
            } => {
                let outcome = self
                    .backend
                    .update_session(&session_id, attributes)
                    .await
                    .map(ResponseData::Updated)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::Members(session_id) => {
                let outcome = self
                    .backend
                    .session_members(&session_id)
                    .await
                    .map(ResponseData::Roster)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::SetReady { session_id, ready } => {
                let outcome = self
                    .backend
                    .set_member_ready(&session_id, ready)
                    .await
                    .map(ResponseData::Roster)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
            Operation::SetSessionAddress {
                session_id,
                address,
            } => {
                let outcome = self
                    .backend
                    .set_session_address(&session_id, address)
                    .await
                    .map(ResponseData::Roster)
                    .map_err(Failure::from);
                self.complete(request_id, outcome);
            }
        }
    }

    fn complete(&self, request_id: RequestId, outcome: Result<ResponseData, Failure>) {
        let continuation = match self.state.lock() {
            Ok(mut state) => {
                state.tasks.remove(&request_id);
                state.pending.remove(&request_id)
            }
            Err(_) => None,
        };

        match continuation {
            Some(continuation) => {
                if let Err(failure) = &outcome {
                    debug!("Request {} failed: {}", request_id, failure);
                }
                continuation(AdapterResponse {
                    request_id,
                    outcome,
                });
            }
            None => debug!("Request {} already completed, dropping result", request_id),
        }
    }

    fn complete_search(
        &self,
        leader: RequestId,
        query: SearchQuery,
        outcome: Result<Vec<SessionDescriptor>, BackendError>,
    ) {
        let waiters: Vec<(RequestId, Continuation)> = match self.state.lock() {
            Ok(mut state) => {
                state.tasks.remove(&leader);
                let owned = state
                    .searches
                    .get(&query)
                    .map(|search| search.leader == leader)
                    .unwrap_or(false);
                let request_ids = if owned {
                    state
                        .searches
                        .remove(&query)
                        .map(|search| search.waiters)
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                request_ids
                    .into_iter()
                    .filter_map(|id| state.pending.remove(&id).map(|c| (id, c)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };

        let outcome = outcome
            .map(|sessions| {
                Arc::new(SearchResult {
                    query,
                    sessions,
                    completed_at: current_timestamp(),
                })
            })
            .map_err(Failure::from);

        match &outcome {
            Ok(result) => info!(
                "Search completed with {} sessions for {} callers",
                result.len(),
                waiters.len()
            ),
            Err(failure) => warn!("Search failed: {}", failure),
        }

        for (request_id, continuation) in waiters {
            let outcome = outcome.clone().map(ResponseData::Found);
            continuation(AdapterResponse {
                request_id,
                outcome,
            });
        }
    }

    pub fn create(
        &self,
        attributes: Attributes,
        capacity: u32,
        continuation: Continuation,
    ) -> RequestId {
        self.submit_operation(
            Operation::Create {
                attributes,
                capacity,
            },
            continuation,
        )
    }

    pub fn search(&self, query: SearchQuery, continuation: Continuation) -> RequestId {
        self.submit_operation(Operation::Search(query), continuation)
    }

    pub fn join(&self, session_id: SessionId, continuation: Continuation) -> RequestId {
        self.submit_operation(Operation::Join(session_id), continuation)
    }

    pub fn leave(&self, session_id: SessionId, continuation: Continuation) -> RequestId {
        self.submit_operation(Operation::Leave(session_id), continuation)
    }

    pub fn update_attributes(
        &self,
        session_id: SessionId,
        attributes: Attributes,
        continuation: Continuation,
    ) -> RequestId {
        self.submit_operation(
            Operation::UpdateAttributes {
                session_id,
                attributes,
            },
            continuation,
        )
    }

    pub fn members(&self, session_id: SessionId, continuation: Continuation) -> RequestId {
        self.submit_operation(Operation::Members(session_id), continuation)
    }

    pub fn set_ready(
        &self,
        session_id: SessionId,
        ready: bool,
        continuation: Continuation,
    ) -> RequestId {
        self.submit_operation(Operation::SetReady { session_id, ready }, continuation)
    }

    pub fn set_session_address(
        &self,
        session_id: SessionId,
        address: String,
        continuation: Continuation,
    ) -> RequestId {
        self.submit_operation(
            Operation::SetSessionAddress {
                session_id,
                address,
            },
            continuation,
        )
    }

    fn submit_operation(&self, operation: Operation, continuation: Continuation) -> RequestId {
        let request = AdapterRequest::new(operation);
        let request_id = request.request_id;
        self.submit(request, continuation);
        request_id
    }

    /// Detach one outstanding request, completing it with `Cancelled` now.
    ///
    /// A shared search keeps running while other requests wait on it; once
    /// nobody waits, its backend call is aborted and the query is forgotten,
    /// so the next identical search makes a fresh call. Returns false if the
    /// request had already completed.
    pub fn abandon(&self, request_id: RequestId) -> bool {
        let continuation = match self.state.lock() {
            Ok(mut state) => {
                let Some(continuation) = state.pending.remove(&request_id) else {
                    return false;
                };

                let mut abort = vec![request_id];
                let mut emptied = None;
                for (query, search) in state.searches.iter_mut() {
                    if let Some(position) = search.waiters.iter().position(|id| *id == request_id) {
                        search.waiters.remove(position);
                        abort.clear();
                        if search.waiters.is_empty() {
                            abort.push(search.leader);
                            emptied = Some(query.clone());
                        }
                        break;
                    }
                }
                if let Some(query) = emptied {
                    state.searches.remove(&query);
                }
                for id in abort {
                    if let Some(task) = state.tasks.remove(&id) {
                        task.abort();
                    }
                }
                continuation
            }
            Err(_) => return false,
        };

        debug!("Request {} abandoned", request_id);
        continuation(AdapterResponse::cancelled(request_id));
        true
    }

    /// Complete every outstanding request with `Cancelled` and refuse new ones.
    ///
    /// Returns the number of continuations cancelled. No continuation runs
    /// after this returns except synchronously inside a later `submit`.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(RequestId, Continuation)> = match self.state.lock() {
            Ok(mut state) => {
                if state.shut_down {
                    return 0;
                }
                state.shut_down = true;
                state.searches.clear();
                for (_, task) in state.tasks.drain() {
                    task.abort();
                }
                state.pending.drain().collect()
            }
            Err(_) => return 0,
        };

        info!(
            "Session adapter shutting down, cancelling {} requests",
            drained.len()
        );

        let count = drained.len();
        for (request_id, continuation) in drained {
            continuation(AdapterResponse::cancelled(request_id));
        }
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().map(|state| state.shut_down).unwrap_or(true)
    }

    /// Requests whose continuation has not run yet
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOperation, InMemorySessionService};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_continuation(sender: mpsc::UnboundedSender<AdapterResponse>) -> Continuation {
        Box::new(move |response| {
            let _ = sender.send(response);
        })
    }

    fn ranked() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("mode".to_string(), "ranked".into());
        attributes
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(BackendResultCode::NoConnection),
            ErrorKind::NetworkUnavailable
        );
        assert_eq!(
            classify(BackendResultCode::TimedOut),
            ErrorKind::NetworkUnavailable
        );
        assert_eq!(classify(BackendResultCode::NotFound), ErrorKind::NotFound);
        assert_eq!(classify(BackendResultCode::SessionFull), ErrorKind::Full);
        assert_eq!(
            classify(BackendResultCode::InvalidUser),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify(BackendResultCode::AlreadyPending),
            ErrorKind::BackendError
        );
    }

    #[tokio::test]
    async fn test_join_failure_is_classified() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 2, 2);
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let request_id = adapter.join(session.id.clone(), channel_continuation(sender));

        let response = receiver.recv().await.unwrap();
        assert_eq!(response.request_id, request_id);
        assert!(!response.success());
        assert_eq!(response.error_kind(), Some(ErrorKind::Full));
        assert_eq!(adapter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_identical_searches_share_one_call() {
        let service = InMemorySessionService::new();
        service.seed_session(ranked(), 1, 4);
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let query = SearchQuery::new(ranked(), 10);

        service.pause();
        let first = adapter.search(query.clone(), channel_continuation(sender.clone()));
        let second = adapter.search(query, channel_continuation(sender));
        assert_eq!(adapter.in_flight(), 2);
        service.resume();

        let a = receiver.recv().await.unwrap();
        let b = receiver.recv().await.unwrap();
        assert_ne!(a.request_id, b.request_id);
        assert!([first, second].contains(&a.request_id));

        match (a.outcome.unwrap(), b.outcome.unwrap()) {
            (ResponseData::Found(x), ResponseData::Found(y)) => {
                assert!(Arc::ptr_eq(&x, &y));
                assert_eq!(x.len(), 1);
            }
            other => panic!("unexpected responses: {:?}", other),
        }
        assert_eq!(service.call_count(BackendOperation::Search), 1);
    }

    #[tokio::test]
    async fn test_different_queries_are_not_shared() {
        let service = InMemorySessionService::new();
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        adapter.search(
            SearchQuery::new(ranked(), 10),
            channel_continuation(sender.clone()),
        );
        adapter.search(SearchQuery::new(ranked(), 5), channel_continuation(sender));

        receiver.recv().await.unwrap();
        receiver.recv().await.unwrap();
        assert_eq!(service.call_count(BackendOperation::Search), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_outstanding_exactly_once() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 1, 4);
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        service.pause();
        adapter.join(session.id.clone(), channel_continuation(sender.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(adapter.shutdown(), 1);
        let response = receiver.try_recv().unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::Cancelled));

        service.resume();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(receiver.try_recv().is_err());
        assert!(!service.is_member(&session.id, "client"));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_cancels_synchronously() {
        let service = InMemorySessionService::new();
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        adapter.shutdown();
        assert!(adapter.is_shut_down());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        adapter.create(ranked(), 4, channel_continuation(sender));

        let response = receiver.try_recv().unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(service.call_count(BackendOperation::Create), 0);
    }

    #[tokio::test]
    async fn test_abandoned_search_is_not_shared_with_later_callers() {
        let service = InMemorySessionService::new();
        service.seed_session(ranked(), 1, 4);
        service.hang_next(BackendOperation::Search);
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let query = SearchQuery::new(ranked(), 10);

        let stuck = adapter.search(query.clone(), channel_continuation(sender.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(adapter.abandon(stuck));
        assert!(!adapter.abandon(stuck));
        let cancelled = receiver.try_recv().unwrap();
        assert_eq!(cancelled.request_id, stuck);
        assert_eq!(cancelled.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(adapter.in_flight(), 0);

        let fresh = adapter.search(query, channel_continuation(sender));
        let response = receiver.recv().await.unwrap();
        assert_eq!(response.request_id, fresh);
        match response.outcome {
            Ok(ResponseData::Found(result)) => assert_eq!(result.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(service.call_count(BackendOperation::Search), 2);
    }

    #[tokio::test]
    async fn test_abandoning_one_waiter_keeps_shared_search() {
        let service = InMemorySessionService::new();
        let adapter = SessionAdapter::new(Arc::new(service.connect("client")));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let query = SearchQuery::new(ranked(), 10);

        service.pause();
        let leader = adapter.search(query.clone(), channel_continuation(sender.clone()));
        let follower = adapter.search(query, channel_continuation(sender));
        assert!(adapter.abandon(leader));
        assert_eq!(receiver.try_recv().unwrap().request_id, leader);
        service.resume();

        let response = receiver.recv().await.unwrap();
        assert_eq!(response.request_id, follower);
        assert!(response.success());
        assert_eq!(service.call_count(BackendOperation::Search), 1);
        assert_eq!(adapter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ready_returns_roster() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 1, 4);
        let client = service.connect("client");
        client.join_session(&session.id).await.unwrap();
        let adapter = SessionAdapter::new(Arc::new(client));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        adapter.set_ready(session.id.clone(), true, channel_continuation(sender));

        match receiver.recv().await.unwrap().outcome {
            Ok(ResponseData::Roster(roster)) => {
                assert_eq!(roster.len(), 2);
                assert_eq!(roster.ready_count(), 1);
                assert!(roster.member("client").unwrap().ready);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_metrics_hooks() {
        let service = InMemorySessionService::new();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let adapter =
            SessionAdapter::new(Arc::new(service.connect("client"))).with_metrics(metrics.clone());
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let query = SearchQuery::new(ranked(), 10);

        service.pause();
        adapter.search(query.clone(), channel_continuation(sender.clone()));
        adapter.search(query, channel_continuation(sender));
        service.resume();
        receiver.recv().await.unwrap();
        receiver.recv().await.unwrap();

        assert_eq!(metrics.adapter().deduplicated_searches_total.get(), 1);
        assert_eq!(
            metrics
                .adapter()
                .requests_total
                .with_label_values(&["search"])
                .get(),
            1
        );
    }
}
