//! In-memory session service for development and testing
//!
//! [`InMemorySessionService`] keeps every session in a map and supports fault
//! injection, pausing and call counting. Each local user talks to it through
//! an [`InMemorySessionBackend`] handle obtained with
//! [`InMemorySessionService::connect`].
//!
//! Every change to a session's members, ready flags or address is broadcast
//! as a [`SessionRoster`] snapshot; creating a session is not.

use crate::backend::provider::{
    BackendError, BackendOperation, BackendResultCode, SessionBackend,
};
use crate::types::{Attributes, SessionDescriptor, SessionId, SessionMember, SessionRoster};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Injected behavior for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Fail(BackendResultCode),
    /// Never answer
    Hang,
}

#[derive(Debug, Clone)]
struct StoredSession {
    descriptor: SessionDescriptor,
    host: String,
    /// Member user ids and their ready flags
    members: BTreeMap<String, bool>,
    session_address: Option<String>,
}

impl StoredSession {
    fn roster(&self) -> SessionRoster {
        SessionRoster {
            session_id: self.descriptor.id.clone(),
            members: self
                .members
                .iter()
                .map(|(user_id, ready)| SessionMember {
                    user_id: user_id.clone(),
                    is_host: *user_id == self.host,
                    ready: *ready,
                })
                .collect(),
            session_address: self.session_address.clone(),
        }
    }

    fn sync_player_count(&mut self) {
        self.descriptor.player_count = self.members.len() as u32;
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    sessions: BTreeMap<SessionId, StoredSession>,
    next_session: u64,
    faults: HashMap<BackendOperation, VecDeque<Fault>>,
    calls: HashMap<BackendOperation, u64>,
    latency: Duration,
}

impl ServiceState {
    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut StoredSession, BackendError> {
        self.sessions.get_mut(session_id).ok_or_else(|| {
            BackendError::new(
                BackendResultCode::NotFound,
                format!("Session {} does not exist", session_id),
            )
        })
    }
}

/// Shared in-memory session service
#[derive(Debug)]
pub struct InMemorySessionService {
    state: Mutex<ServiceState>,
    /// Operations currently held at entry
    paused: watch::Sender<BTreeSet<BackendOperation>>,
    invalidations: broadcast::Sender<SessionId>,
    rosters: broadcast::Sender<SessionRoster>,
}

impl InMemorySessionService {
    pub fn new() -> Arc<Self> {
        let (paused, _) = watch::channel(BTreeSet::new());
        let (invalidations, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (rosters, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(ServiceState::default()),
            paused,
            invalidations,
            rosters,
        })
    }

    /// Get a backend handle acting as `user`
    pub fn connect(self: &Arc<Self>, user: impl Into<String>) -> InMemorySessionBackend {
        InMemorySessionBackend {
            service: self.clone(),
            user: user.into(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ServiceState>, BackendError> {
        self.state.lock().map_err(|_| {
            BackendError::new(
                BackendResultCode::UnexpectedError,
                "Failed to acquire session service lock",
            )
        })
    }

    /// Publish a session hosted by a synthetic user with `player_count` members
    pub fn seed_session(
        &self,
        attributes: Attributes,
        player_count: u32,
        capacity: u32,
    ) -> SessionDescriptor {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = next_session_id(&mut state);
        let host = format!("seed-host-{}", id);
        let mut members: BTreeMap<String, bool> = (1..player_count)
            .map(|index| (format!("seed-member-{}-{}", id, index), false))
            .collect();
        if player_count > 0 {
            members.insert(host.clone(), false);
        }

        let address = host_address(&id);
        let descriptor = SessionDescriptor {
            id: id.clone(),
            attributes,
            player_count: members.len() as u32,
            capacity,
            host_address: Some(address.clone()),
        };

        state.sessions.insert(
            id,
            StoredSession {
                descriptor: descriptor.clone(),
                host,
                members,
                session_address: Some(address),
            },
        );
        descriptor
    }

    /// Make the next calls of `operation` fail with `code`, in order
    pub fn fail_next(&self, operation: BackendOperation, code: BackendResultCode) {
        self.push_fault(operation, Fault::Fail(code));
    }

    /// Make the next call of `operation` never answer
    pub fn hang_next(&self, operation: BackendOperation) {
        self.push_fault(operation, Fault::Hang);
    }

    fn push_fault(&self, operation: BackendOperation, fault: Fault) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.faults.entry(operation).or_default().push_back(fault);
    }

    /// Add a delay to every call
    pub fn set_latency(&self, latency: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.latency = latency;
    }

    /// Hold every call until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.paused
            .send_replace(BackendOperation::ALL.into_iter().collect());
    }

    /// Hold calls of one operation until [`resume`](Self::resume)
    pub fn pause_operation(&self, operation: BackendOperation) {
        self.paused.send_modify(|paused| {
            paused.insert(operation);
        });
    }

    pub fn resume(&self) {
        self.paused.send_replace(BTreeSet::new());
    }

    /// Number of calls made for `operation`, including failed ones
    pub fn call_count(&self, operation: BackendOperation) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionDescriptor> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .sessions
            .get(session_id)
            .map(|stored| stored.descriptor.clone())
    }

    pub fn roster(&self, session_id: &SessionId) -> Option<SessionRoster> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.get(session_id).map(StoredSession::roster)
    }

    pub fn session_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.len()
    }

    pub fn is_member(&self, session_id: &SessionId, user: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .sessions
            .get(session_id)
            .map(|stored| stored.members.contains_key(user))
            .unwrap_or(false)
    }

    /// Destroy a session as the service would on timeout
    pub fn evict(&self, session_id: &SessionId) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.sessions.remove(session_id).is_some()
        };
        if removed {
            info!("Session {} evicted by service", session_id);
            let _ = self.invalidations.send(session_id.clone());
        }
        removed
    }

    fn publish_roster(&self, roster: SessionRoster) {
        debug!(
            "Session {} roster: {} members, {} ready",
            roster.session_id,
            roster.len(),
            roster.ready_count()
        );
        let _ = self.rosters.send(roster);
    }

    /// Count the call, then either wait out latency and pause or apply an injected fault
    async fn enter(&self, operation: BackendOperation) -> Result<(), BackendError> {
        let (fault, latency) = {
            let mut state = self.lock()?;
            *state.calls.entry(operation).or_insert(0) += 1;
            let fault = state
                .faults
                .get_mut(&operation)
                .and_then(|queue| queue.pop_front());
            (fault, state.latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !paused.contains(&operation)).await;

        match fault {
            Some(Fault::Fail(code)) => {
                debug!("Injected {} fault for {:?}", code, operation);
                Err(BackendError::new(code, format!("injected fault for {:?}", operation)))
            }
            Some(Fault::Hang) => {
                debug!("Injected hang for {:?}", operation);
                std::future::pending().await
            }
            None => Ok(()),
        }
    }
}

fn next_session_id(state: &mut ServiceState) -> SessionId {
    state.next_session += 1;
    SessionId::new(format!("session-{:04}", state.next_session))
}

fn host_address(id: &SessionId) -> String {
    format!("{}.sessions.local:7777", id)
}

/// Backend handle bound to one user of an [`InMemorySessionService`]
#[derive(Debug, Clone)]
pub struct InMemorySessionBackend {
    service: Arc<InMemorySessionService>,
    user: String,
}

impl InMemorySessionBackend {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn service(&self) -> &Arc<InMemorySessionService> {
        &self.service
    }

    fn not_a_member(&self, session_id: &SessionId) -> BackendError {
        BackendError::new(
            BackendResultCode::NotFound,
            format!("User '{}' is not in session {}", self.user, session_id),
        )
    }
}

#[async_trait]
impl SessionBackend for InMemorySessionBackend {
    async fn create_session(
        &self,
        attributes: Attributes,
        capacity: u32,
    ) -> Result<SessionDescriptor, BackendError> {
        self.service.enter(BackendOperation::Create).await?;

        if capacity == 0 {
            return Err(BackendError::new(
                BackendResultCode::InvalidParameters,
                "Session capacity must be greater than 0",
            ));
        }

        let mut state = self.service.lock()?;
        let id = next_session_id(&mut state);
        let address = host_address(&id);
        let descriptor = SessionDescriptor {
            id: id.clone(),
            attributes,
            player_count: 1,
            capacity,
            host_address: Some(address.clone()),
        };

        state.sessions.insert(
            id.clone(),
            StoredSession {
                descriptor: descriptor.clone(),
                host: self.user.clone(),
                members: BTreeMap::from([(self.user.clone(), false)]),
                session_address: Some(address),
            },
        );

        info!(
            "User '{}' created {}session {}",
            self.user,
            if descriptor.is_private() { "private " } else { "" },
            id
        );
        Ok(descriptor)
    }

    async fn find_sessions(
        &self,
        filters: &Attributes,
        max_results: usize,
    ) -> Result<Vec<SessionDescriptor>, BackendError> {
        self.service.enter(BackendOperation::Search).await?;

        let state = self.service.lock()?;
        let found: Vec<SessionDescriptor> = state
            .sessions
            .values()
            .filter(|stored| !stored.descriptor.is_private())
            .filter(|stored| stored.descriptor.matches(filters))
            .take(max_results)
            .map(|stored| stored.descriptor.clone())
            .collect();

        debug!(
            "User '{}' search matched {} sessions (max {})",
            self.user,
            found.len(),
            max_results
        );
        Ok(found)
    }

    async fn join_session(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionDescriptor, BackendError> {
        self.service.enter(BackendOperation::Join).await?;

        let (descriptor, roster) = {
            let mut state = self.service.lock()?;
            let stored = state.session_mut(session_id)?;

            if stored.members.contains_key(&self.user) {
                return Ok(stored.descriptor.clone());
            }

            if stored.descriptor.is_full() {
                return Err(BackendError::new(
                    BackendResultCode::SessionFull,
                    format!("Session {} is full", session_id),
                ));
            }

            stored.members.insert(self.user.clone(), false);
            stored.sync_player_count();
            (stored.descriptor.clone(), stored.roster())
        };

        info!(
            "User '{}' joined session {} ({}/{})",
            self.user, session_id, descriptor.player_count, descriptor.capacity
        );
        self.service.publish_roster(roster);
        Ok(descriptor)
    }

    async fn leave_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.service.enter(BackendOperation::Leave).await?;

        let remaining = {
            let mut state = self.service.lock()?;
            let stored = state.session_mut(session_id)?;

            stored.members.remove(&self.user);
            stored.sync_player_count();

            if stored.host == self.user || stored.members.is_empty() {
                state.sessions.remove(session_id);
                None
            } else {
                Some(stored.roster())
            }
        };

        match remaining {
            Some(roster) => {
                info!("User '{}' left session {}", self.user, session_id);
                self.service.publish_roster(roster);
            }
            None => {
                info!(
                    "Session {} destroyed after user '{}' left",
                    session_id, self.user
                );
                let _ = self.service.invalidations.send(session_id.clone());
            }
        }

        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &SessionId,
        attributes: Attributes,
    ) -> Result<SessionDescriptor, BackendError> {
        self.service.enter(BackendOperation::Update).await?;

        let mut state = self.service.lock()?;
        let stored = state.session_mut(session_id)?;

        if stored.host != self.user {
            return Err(BackendError::new(
                BackendResultCode::NoPermission,
                format!("Only the host may update session {}", session_id),
            ));
        }

        stored.descriptor.attributes.extend(attributes);
        Ok(stored.descriptor.clone())
    }

    async fn session_members(&self, session_id: &SessionId) -> Result<SessionRoster, BackendError> {
        self.service.enter(BackendOperation::Members).await?;

        let mut state = self.service.lock()?;
        let stored = state.session_mut(session_id)?;
        if !stored.members.contains_key(&self.user) {
            return Err(self.not_a_member(session_id));
        }
        Ok(stored.roster())
    }

    async fn set_member_ready(
        &self,
        session_id: &SessionId,
        ready: bool,
    ) -> Result<SessionRoster, BackendError> {
        self.service.enter(BackendOperation::SetReady).await?;

        let roster = {
            let mut state = self.service.lock()?;
            let stored = state.session_mut(session_id)?;
            match stored.members.get_mut(&self.user) {
                Some(flag) => *flag = ready,
                None => return Err(self.not_a_member(session_id)),
            }
            stored.roster()
        };

        debug!(
            "User '{}' is {} in session {}",
            self.user,
            if ready { "ready" } else { "not ready" },
            session_id
        );
        self.service.publish_roster(roster.clone());
        Ok(roster)
    }

    async fn set_session_address(
        &self,
        session_id: &SessionId,
        address: String,
    ) -> Result<SessionRoster, BackendError> {
        self.service.enter(BackendOperation::SetAddress).await?;

        let roster = {
            let mut state = self.service.lock()?;
            let stored = state.session_mut(session_id)?;
            if stored.host != self.user {
                return Err(BackendError::new(
                    BackendResultCode::NoPermission,
                    format!("Only the host may set the address of session {}", session_id),
                ));
            }
            stored.session_address = Some(address.clone());
            stored.descriptor.host_address = Some(address);
            stored.roster()
        };

        info!(
            "Session {} address set to {:?}",
            session_id, roster.session_address
        );
        self.service.publish_roster(roster.clone());
        Ok(roster)
    }

    fn invalidations(&self) -> Option<broadcast::Receiver<SessionId>> {
        Some(self.service.invalidations.subscribe())
    }

    fn roster_updates(&self) -> Option<broadcast::Receiver<SessionRoster>> {
        Some(self.service.rosters.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PRIVATE_ATTRIBUTE;

    fn ranked() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("mode".to_string(), "ranked".into());
        attributes
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");

        let created = host.create_session(ranked(), 4).await.unwrap();
        assert_eq!(created.player_count, 1);
        assert!(created.host_address.is_some());

        let found = host.find_sessions(&ranked(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, created.id);

        let mut casual = Attributes::new();
        casual.insert("mode".to_string(), "casual".into());
        assert!(host.find_sessions(&casual, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_respects_max_results() {
        let service = InMemorySessionService::new();
        for _ in 0..5 {
            service.seed_session(ranked(), 1, 4);
        }
        let client = service.connect("client");
        assert_eq!(client.find_sessions(&ranked(), 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_join_full_and_missing() {
        let service = InMemorySessionService::new();
        let full = service.seed_session(ranked(), 2, 2);
        let client = service.connect("client");

        let err = client.join_session(&full.id).await.unwrap_err();
        assert_eq!(err.code, BackendResultCode::SessionFull);

        let err = client
            .join_session(&SessionId::new("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendResultCode::NotFound);
    }

    #[tokio::test]
    async fn test_host_leave_destroys_and_notifies() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");
        let guest = service.connect("guest");
        let mut notices = guest.invalidations().unwrap();

        let session = host.create_session(ranked(), 4).await.unwrap();
        let joined = guest.join_session(&session.id).await.unwrap();
        assert_eq!(joined.player_count, 2);

        host.leave_session(&session.id).await.unwrap();
        assert!(service.session(&session.id).is_none());
        assert_eq!(notices.recv().await.unwrap(), session.id);
    }

    #[tokio::test]
    async fn test_update_requires_host() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");
        let guest = service.connect("guest");
        let session = host.create_session(ranked(), 4).await.unwrap();
        guest.join_session(&session.id).await.unwrap();

        let mut update = Attributes::new();
        update.insert("map".to_string(), "harbor".into());

        let err = guest
            .update_session(&session.id, update.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendResultCode::NoPermission);

        let updated = host.update_session(&session.id, update).await.unwrap();
        assert_eq!(updated.attribute("map"), Some(&"harbor".into()));
        assert_eq!(updated.attribute("mode"), Some(&"ranked".into()));
    }

    #[tokio::test]
    async fn test_fault_injection_and_counters() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 1, 4);
        let client = service.connect("client");
        service.fail_next(BackendOperation::Join, BackendResultCode::NoConnection);

        let err = client.join_session(&session.id).await.unwrap_err();
        assert_eq!(err.code, BackendResultCode::NoConnection);
        assert!(client.join_session(&session.id).await.is_ok());
        assert_eq!(service.call_count(BackendOperation::Join), 2);
        assert!(service.is_member(&session.id, "client"));
    }

    #[tokio::test]
    async fn test_pause_holds_calls() {
        let service = InMemorySessionService::new();
        let client = service.connect("client");
        service.pause();

        let task = tokio::spawn(async move { client.find_sessions(&Attributes::new(), 10).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(service.call_count(BackendOperation::Search), 1);

        service.resume();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pause_single_operation() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 1, 4);
        let client = service.connect("client");
        service.pause_operation(BackendOperation::Join);

        assert_eq!(client.find_sessions(&ranked(), 10).await.unwrap().len(), 1);

        let joiner = client.clone();
        let id = session.id.clone();
        let task = tokio::spawn(async move { joiner.join_session(&id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        service.resume();
        assert_eq!(task.await.unwrap().unwrap().player_count, 2);
    }

    #[tokio::test]
    async fn test_private_sessions_are_not_found() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");
        let guest = service.connect("guest");

        let mut hidden = ranked();
        hidden.insert(PRIVATE_ATTRIBUTE.to_string(), true.into());
        let private = host.create_session(hidden, 4).await.unwrap();
        let mut open = ranked();
        open.insert(PRIVATE_ATTRIBUTE.to_string(), false.into());
        let public = host.create_session(open, 4).await.unwrap();

        let found = guest.find_sessions(&ranked(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, public.id);

        // Still joinable by id
        assert!(guest.join_session(&private.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_flags_publish_rosters() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");
        let guest = service.connect("guest");
        let mut rosters = host.roster_updates().unwrap();

        let session = host.create_session(ranked(), 4).await.unwrap();
        guest.join_session(&session.id).await.unwrap();
        let joined = rosters.recv().await.unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.ready_count(), 0);
        assert_eq!(joined.host().map(|m| m.user_id.as_str()), Some("host"));

        host.set_member_ready(&session.id, true).await.unwrap();
        let roster = guest.set_member_ready(&session.id, true).await.unwrap();
        assert!(roster.all_ready());
        assert_eq!(rosters.recv().await.unwrap().ready_count(), 1);
        assert!(rosters.recv().await.unwrap().all_ready());

        guest.leave_session(&session.id).await.unwrap();
        let left = rosters.recv().await.unwrap();
        assert_eq!(left.len(), 1);
        assert!(left.member("guest").is_none());
    }

    #[tokio::test]
    async fn test_ready_requires_membership() {
        let service = InMemorySessionService::new();
        let session = service.seed_session(ranked(), 1, 4);
        let outsider = service.connect("outsider");

        let err = outsider
            .set_member_ready(&session.id, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendResultCode::NotFound);
        let err = outsider.session_members(&session.id).await.unwrap_err();
        assert_eq!(err.code, BackendResultCode::NotFound);
    }

    #[tokio::test]
    async fn test_session_address_requires_host() {
        let service = InMemorySessionService::new();
        let host = service.connect("host");
        let guest = service.connect("guest");
        let session = host.create_session(ranked(), 4).await.unwrap();
        guest.join_session(&session.id).await.unwrap();

        let err = guest
            .set_session_address(&session.id, "10.0.0.9:7777".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendResultCode::NoPermission);

        let roster = host
            .set_session_address(&session.id, "10.0.0.1:7777".to_string())
            .await
            .unwrap();
        assert_eq!(roster.session_address.as_deref(), Some("10.0.0.1:7777"));
        assert_eq!(
            service.session(&session.id).unwrap().host_address.as_deref(),
            Some("10.0.0.1:7777")
        );
    }

    #[tokio::test]
    async fn test_hang_holds_one_call() {
        let service = InMemorySessionService::new();
        let client = service.connect("client");
        service.hang_next(BackendOperation::Search);

        let hung = client.clone();
        let task = tokio::spawn(async move { hung.find_sessions(&Attributes::new(), 10).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        task.abort();

        assert!(client.find_sessions(&Attributes::new(), 10).await.is_ok());
        assert_eq!(service.call_count(BackendOperation::Search), 2);
    }
}
