//! Matchmaking actor
//!
//! One tokio task per local player owns the [`StateMachine`] and is the only
//! place tickets are mutated. Commands from [`Matchmaker`] handles, adapter
//! completions, retry and timeout timers all arrive on the same channel, so
//! they are handled strictly one at a time in arrival order.
//!
//! A completion is applied only if its request id is the one the active
//! ticket is waiting on. Anything else is disregarded without touching
//! state or emitting events.
//!
//! Backend invalidation and roster notices are selected alongside the
//! channel and only affect a ticket that is `InSession` in the named session.
//!
//! [`Matchmaker`]: crate::orchestrator::Matchmaker

use crate::adapter::{AdapterResponse, Continuation, ResponseData, SessionAdapter};
use crate::config::MatchmakingConfig;
use crate::error::{ErrorKind, Failure, MatchmakingError, Result};
use crate::events::EventPublisher;
use crate::metrics::MetricsCollector;
use crate::orchestrator::ranking::rank_candidates;
use crate::state::{MatchmakingState, StateMachine, TicketIntent};
use crate::types::{
    Attributes, JoinOutcome, MatchmakingEvent, MatchmakingStatus, OrderingPreference, RequestId,
    RosterEvent, SearchQuery, SessionAddressEvent, SessionDescriptor, SessionId, SessionRoster,
    TicketId, TicketOutcome, TicketResult, TransitionEvent, TransitionReason, BUCKET_ATTRIBUTE,
};
use crate::utils::{backoff_delay, current_timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent by [`Matchmaker`](crate::orchestrator::Matchmaker) handles
pub(crate) enum Command {
    StartQuickMatch {
        filters: Attributes,
        ordering: Vec<OrderingPreference>,
        reply: Reply<TicketId>,
    },
    CreateSession {
        attributes: Attributes,
        capacity: Option<u32>,
        reply: Reply<TicketId>,
    },
    Cancel {
        ticket_id: TicketId,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<PendingLeave>,
    },
    AcknowledgeFailure {
        reply: Reply<()>,
    },
    UpdateAttributes {
        attributes: Attributes,
        reply: Reply<SessionDescriptor>,
    },
    Members {
        reply: Reply<SessionRoster>,
    },
    SetReady {
        ready: bool,
        reply: Reply<SessionRoster>,
    },
    SetSessionAddress {
        address: String,
        reply: Reply<SessionRoster>,
    },
    Status {
        reply: oneshot::Sender<MatchmakingStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum ActorMessage {
    Command(Command),
    Completion {
        ticket_id: TicketId,
        response: AdapterResponse,
    },
    RetryJoin {
        ticket_id: TicketId,
        token: RequestId,
    },
    SearchTimeout {
        ticket_id: TicketId,
        request_id: RequestId,
    },
}

/// Completion handle for a leave in progress.
///
/// Every call to `leave_current_session` made while the same leave is in
/// progress gets a clone of the same handle.
#[derive(Debug, Clone)]
pub struct PendingLeave {
    ticket_id: TicketId,
    done: watch::Receiver<bool>,
}

impl PendingLeave {
    pub fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the ticket is back in `Idle`
    pub async fn wait(mut self) -> Result<()> {
        self.done
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| MatchmakingError::ShutDown.into())
    }
}

struct LeaveSignal {
    handle: PendingLeave,
    sender: watch::Sender<bool>,
}

/// Caller waiting on a request against the current session
enum SessionReply {
    Descriptor(Reply<SessionDescriptor>),
    Roster(Reply<SessionRoster>),
}

impl SessionReply {
    fn fail(self, error: anyhow::Error) {
        match self {
            SessionReply::Descriptor(reply) => {
                let _ = reply.send(Err(error));
            }
            SessionReply::Roster(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

pub(crate) struct MatchmakingActor {
    machine: StateMachine,
    adapter: SessionAdapter,
    publisher: Arc<EventPublisher>,
    metrics: Arc<MetricsCollector>,
    config: MatchmakingConfig,
    receiver: mpsc::UnboundedReceiver<ActorMessage>,
    sender: mpsc::WeakUnboundedSender<ActorMessage>,
    invalidations: Option<broadcast::Receiver<SessionId>>,
    rosters: Option<broadcast::Receiver<SessionRoster>>,
    leave: Option<LeaveSignal>,
    session_requests: HashMap<RequestId, SessionReply>,
}

impl MatchmakingActor {
    pub(crate) fn new(
        adapter: SessionAdapter,
        publisher: Arc<EventPublisher>,
        metrics: Arc<MetricsCollector>,
        config: MatchmakingConfig,
        receiver: mpsc::UnboundedReceiver<ActorMessage>,
        sender: mpsc::WeakUnboundedSender<ActorMessage>,
    ) -> Self {
        let invalidations = adapter.invalidations();
        let rosters = adapter.roster_updates();
        Self {
            machine: StateMachine::new(),
            adapter,
            publisher,
            metrics,
            config,
            receiver,
            sender,
            invalidations,
            rosters,
            leave: None,
            session_requests: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Matchmaking actor started");

        loop {
            tokio::select! {
                message = self.receiver.recv() => match message {
                    Some(message) => {
                        if !self.handle_message(message) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(session_id) = next_notice(&mut self.invalidations, "session invalidation") => {
                    self.on_session_invalidated(session_id);
                }
                Some(roster) = next_notice(&mut self.rosters, "roster") => {
                    self.apply_roster(roster);
                }
            }
        }

        self.adapter.shutdown();
        info!("Matchmaking actor stopped");
    }

    /// Returns false once the actor should stop
    fn handle_message(&mut self, message: ActorMessage) -> bool {
        match message {
            ActorMessage::Command(command) => return self.handle_command(command),
            ActorMessage::Completion {
                ticket_id,
                response,
            } => self.on_completion(ticket_id, response),
            ActorMessage::RetryJoin { ticket_id, token } => self.on_retry_join(ticket_id, token),
            ActorMessage::SearchTimeout {
                ticket_id,
                request_id,
            } => self.on_search_timeout(ticket_id, request_id),
        }
        true
    }

    /// Returns false once the actor should stop
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartQuickMatch {
                filters,
                ordering,
                reply,
            } => {
                let _ = reply.send(self.start_quick_match(filters, ordering));
            }
            Command::CreateSession {
                attributes,
                capacity,
                reply,
            } => {
                let _ = reply.send(self.create_session(attributes, capacity));
            }
            Command::Cancel { ticket_id, reply } => {
                let _ = reply.send(self.cancel(ticket_id));
            }
            Command::Leave { reply } => {
                let _ = reply.send(self.leave_current_session(TransitionReason::LeaveRequested));
            }
            Command::AcknowledgeFailure { reply } => {
                let _ = reply.send(self.acknowledge_failure());
            }
            Command::UpdateAttributes { attributes, reply } => {
                self.session_request(
                    "update session attributes",
                    SessionReply::Descriptor(reply),
                    |adapter, session_id, continuation| {
                        adapter.update_attributes(session_id, attributes, continuation)
                    },
                );
            }
            Command::Members { reply } => {
                self.session_request(
                    "get session members",
                    SessionReply::Roster(reply),
                    |adapter, session_id, continuation| adapter.members(session_id, continuation),
                );
            }
            Command::SetReady { ready, reply } => {
                self.session_request(
                    "set ready",
                    SessionReply::Roster(reply),
                    |adapter, session_id, continuation| {
                        adapter.set_ready(session_id, ready, continuation)
                    },
                );
            }
            Command::SetSessionAddress { address, reply } => {
                self.session_request(
                    "set session address",
                    SessionReply::Roster(reply),
                    |adapter, session_id, continuation| {
                        adapter.set_session_address(session_id, address, continuation)
                    },
                );
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                if let Some(ticket) = self.machine.clear() {
                    info!(
                        "Dropping ticket {} in state {} on shutdown",
                        ticket.id(),
                        ticket.state()
                    );
                }
                self.adapter.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start_quick_match(
        &mut self,
        mut filters: Attributes,
        ordering: Vec<OrderingPreference>,
    ) -> Result<TicketId> {
        self.apply_default_bucket(&mut filters);
        let query = SearchQuery::new(filters.clone(), self.config.max_search_results)
            .with_ordering(ordering);

        let event = self.machine.begin(
            TicketIntent::QuickMatch { filters },
            MatchmakingState::Searching,
            TransitionReason::QuickMatchRequested,
        )?;
        let ticket_id = event.ticket_id;
        self.metrics.record_ticket_started("quick_match");
        info!("Ticket {} started quick match", ticket_id);
        self.emit(event);

        let request_id = self.dispatch(ticket_id, |adapter, continuation| {
            adapter.search(query, continuation)
        });
        self.arm_search_timeout(ticket_id, request_id);

        Ok(ticket_id)
    }

    fn create_session(&mut self, mut attributes: Attributes, capacity: Option<u32>) -> Result<TicketId> {
        self.apply_default_bucket(&mut attributes);
        let capacity = capacity.unwrap_or(self.config.default_capacity);

        let event = self.machine.begin(
            TicketIntent::Create {
                attributes: attributes.clone(),
                capacity,
            },
            MatchmakingState::Creating,
            TransitionReason::CreateRequested,
        )?;
        let ticket_id = event.ticket_id;
        self.metrics.record_ticket_started("create");
        info!("Ticket {} creating session (capacity {})", ticket_id, capacity);
        self.emit(event);

        self.dispatch(ticket_id, |adapter, continuation| {
            adapter.create(attributes, capacity, continuation)
        });

        Ok(ticket_id)
    }

    fn cancel(&mut self, ticket_id: TicketId) -> Result<()> {
        let state = match self.machine.active() {
            Some(ticket) if ticket.id() == ticket_id => ticket.state(),
            _ => return Err(MatchmakingError::TicketNotFound { ticket_id }.into()),
        };

        match state {
            MatchmakingState::InSession => {
                self.leave_current_session(TransitionReason::LeaveRequested)?;
                Ok(())
            }
            MatchmakingState::Leaving => Ok(()),
            MatchmakingState::Failed => Err(MatchmakingError::InvalidState {
                state: state.to_string(),
                operation: "cancel".to_string(),
            }
            .into()),
            _ => {
                let pending = self
                    .machine
                    .ticket_mut(ticket_id)
                    .and_then(|ticket| ticket.clear_pending());
                if let Some(request_id) = pending {
                    debug!(
                        "Ticket {} cancelled, disregarding request {}",
                        ticket_id, request_id
                    );
                    // Joins keep running; a late success is left in `disregard`
                    if state == MatchmakingState::Searching {
                        self.adapter.abandon(request_id);
                    }
                }
                info!("Ticket {} cancelled in state {}", ticket_id, state);
                self.transition(MatchmakingState::Idle, TransitionReason::Cancelled)
            }
        }
    }

    fn leave_current_session(&mut self, reason: TransitionReason) -> Result<PendingLeave> {
        let state = self.machine.state();
        match state {
            MatchmakingState::Leaving => match &self.leave {
                Some(signal) => Ok(signal.handle.clone()),
                None => Err(MatchmakingError::InternalError {
                    message: "Leaving without a pending leave".to_string(),
                }
                .into()),
            },
            MatchmakingState::InSession => {
                let (ticket_id, session_id) = match self.machine.active() {
                    Some(ticket) => match ticket.session() {
                        Some(session) => (ticket.id(), session.id.clone()),
                        None => {
                            return Err(MatchmakingError::InternalError {
                                message: format!("Ticket {} in session without a session", ticket.id()),
                            }
                            .into())
                        }
                    },
                    None => {
                        return Err(MatchmakingError::InvalidState {
                            state: state.to_string(),
                            operation: "leave".to_string(),
                        }
                        .into())
                    }
                };

                self.transition(MatchmakingState::Leaving, reason)?;

                let (sender, receiver) = watch::channel(false);
                let handle = PendingLeave {
                    ticket_id,
                    done: receiver,
                };
                self.leave = Some(LeaveSignal {
                    handle: handle.clone(),
                    sender,
                });

                info!("Ticket {} leaving session {}", ticket_id, session_id);
                self.dispatch(ticket_id, |adapter, continuation| {
                    adapter.leave(session_id, continuation)
                });
                Ok(handle)
            }
            _ => Err(MatchmakingError::InvalidState {
                state: state.to_string(),
                operation: "leave".to_string(),
            }
            .into()),
        }
    }

    fn acknowledge_failure(&mut self) -> Result<()> {
        let state = self.machine.state();
        if state != MatchmakingState::Failed {
            return Err(MatchmakingError::InvalidState {
                state: state.to_string(),
                operation: "acknowledge failure".to_string(),
            }
            .into());
        }
        self.transition(MatchmakingState::Idle, TransitionReason::FailureAcknowledged)
    }

    /// Send a request against the current session, answering `reply` when it completes
    fn session_request<F>(&mut self, operation: &str, reply: SessionReply, submit: F)
    where
        F: FnOnce(&SessionAdapter, SessionId, Continuation) -> RequestId,
    {
        let target = match self.machine.active() {
            Some(ticket) if ticket.state() == MatchmakingState::InSession => ticket
                .session()
                .map(|session| (ticket.id(), session.id.clone())),
            _ => None,
        };

        let Some((ticket_id, session_id)) = target else {
            warn!("{} rejected in state {}", operation, self.machine.state());
            reply.fail(
                MatchmakingError::InvalidState {
                    state: self.machine.state().to_string(),
                    operation: operation.to_string(),
                }
                .into(),
            );
            return;
        };

        debug!("Ticket {} {} on {}", ticket_id, operation, session_id);
        let request_id = self.dispatch_untracked(ticket_id, |adapter, continuation| {
            submit(adapter, session_id, continuation)
        });
        self.session_requests.insert(request_id, reply);
    }

    fn status(&self) -> MatchmakingStatus {
        let active = self.machine.active();
        MatchmakingStatus {
            state: self.machine.state(),
            ticket_id: active.map(|ticket| ticket.id()),
            session: active.and_then(|ticket| ticket.session().cloned()),
            roster: active.and_then(|ticket| ticket.roster().cloned()),
            last_failure: active
                .and_then(|ticket| ticket.failure().cloned())
                .or_else(|| self.machine.last_failure().cloned()),
        }
    }

    fn on_completion(&mut self, ticket_id: TicketId, response: AdapterResponse) {
        if let Some(reply) = self.session_requests.remove(&response.request_id) {
            self.on_session_reply(ticket_id, response, reply);
            return;
        }

        let state = match self.machine.ticket_mut(ticket_id) {
            Some(ticket) if ticket.pending_request() == Some(response.request_id) => {
                ticket.clear_pending();
                ticket.state()
            }
            _ => {
                self.disregard(ticket_id, response);
                return;
            }
        };

        let result = match state {
            MatchmakingState::Searching => self.on_search_completed(ticket_id, response),
            MatchmakingState::Joining => self.on_join_completed(ticket_id, response),
            MatchmakingState::Creating => self.on_create_completed(response),
            MatchmakingState::Leaving => self.on_leave_completed(response),
            other => Err(MatchmakingError::InvalidState {
                state: other.to_string(),
                operation: "apply adapter completion".to_string(),
            }
            .into()),
        };

        if let Err(e) = result {
            error!("Ticket {} failed to apply completion: {}", ticket_id, e);
        }
    }

    fn on_search_completed(&mut self, ticket_id: TicketId, response: AdapterResponse) -> Result<()> {
        let result = match response.outcome {
            Ok(ResponseData::Found(result)) => result,
            Ok(other) => return Err(unexpected_payload("search", &other)),
            Err(failure) => return self.on_failure(failure),
        };

        let candidates = rank_candidates(
            &result,
            &result.query.ordering,
            self.config.max_search_results,
        );
        info!(
            "Ticket {} search returned {} sessions, {} candidates",
            ticket_id,
            result.len(),
            candidates.len()
        );

        if candidates.is_empty() {
            return self.fall_back_or_fail(TransitionReason::NoCandidates);
        }

        let count = candidates.len();
        if let Some(ticket) = self.machine.ticket_mut(ticket_id) {
            ticket.set_candidates(candidates, response.request_id);
        }
        self.transition(
            MatchmakingState::EvaluatingCandidates,
            TransitionReason::CandidatesFound { count },
        )?;
        self.join_next_candidate(ticket_id)
    }

    fn join_next_candidate(&mut self, ticket_id: TicketId) -> Result<()> {
        let session_id = {
            let ticket = self
                .machine
                .ticket_mut(ticket_id)
                .ok_or(MatchmakingError::TicketNotFound { ticket_id })?;
            let index = match ticket.next_candidate() {
                Some((index, _)) => index,
                None => {
                    return Err(MatchmakingError::InternalError {
                        message: format!("Ticket {} has no untried candidates", ticket_id),
                    }
                    .into())
                }
            };
            match ticket.select_candidate(index) {
                Some(candidate) => candidate.id.clone(),
                None => {
                    return Err(MatchmakingError::InternalError {
                        message: format!("Ticket {} lost candidate {}", ticket_id, index),
                    }
                    .into())
                }
            }
        };

        self.transition(
            MatchmakingState::Joining,
            TransitionReason::CandidateSelected {
                session_id: session_id.clone(),
            },
        )?;
        self.send_join(ticket_id, session_id);
        Ok(())
    }

    fn send_join(&mut self, ticket_id: TicketId, session_id: SessionId) {
        debug!("Ticket {} joining {}", ticket_id, session_id);
        self.dispatch(ticket_id, |adapter, continuation| {
            adapter.join(session_id, continuation)
        });
    }

    fn on_join_completed(&mut self, ticket_id: TicketId, response: AdapterResponse) -> Result<()> {
        let failure = match response.outcome {
            Ok(ResponseData::Joined(session)) => {
                self.record_attempt(ticket_id, JoinOutcome::Success);
                info!("Ticket {} joined session {}", ticket_id, session.id);
                return self.enter_session(ticket_id, session, TransitionReason::Joined);
            }
            Ok(other) => return Err(unexpected_payload("join", &other)),
            Err(failure) => failure,
        };

        let session_id = self
            .machine
            .active()
            .and_then(|ticket| ticket.current_candidate())
            .map(|candidate| candidate.id.clone())
            .ok_or(MatchmakingError::TicketNotFound { ticket_id })?;

        match failure.kind {
            ErrorKind::Cancelled => self.on_failure(failure),
            ErrorKind::NetworkUnavailable if self.schedule_retry(ticket_id, &session_id) => Ok(()),
            kind if kind.is_candidate_level() || kind.is_transient() => {
                self.record_attempt(ticket_id, JoinOutcome::from(kind));
                warn!(
                    "Ticket {} could not join {}: {}",
                    ticket_id, session_id, failure
                );

                let untried = self
                    .machine
                    .active()
                    .map(|ticket| ticket.has_untried_candidates())
                    .unwrap_or(false);
                if untried {
                    self.transition(
                        MatchmakingState::EvaluatingCandidates,
                        TransitionReason::JoinFailed { session_id, kind },
                    )?;
                    self.join_next_candidate(ticket_id)
                } else {
                    self.fall_back_or_fail(TransitionReason::CandidatesExhausted)
                }
            }
            kind => {
                self.record_attempt(ticket_id, JoinOutcome::from(kind));
                self.on_failure(failure)
            }
        }
    }

    /// Schedule another join against the current candidate if retries remain
    fn schedule_retry(&mut self, ticket_id: TicketId, session_id: &SessionId) -> bool {
        let max_retries = self.config.max_network_retries;
        let base = self.config.network_retry_backoff;

        let Some(ticket) = self.machine.ticket_mut(ticket_id) else {
            return false;
        };
        if ticket.retry_count() >= max_retries {
            return false;
        }

        let retry = ticket.note_retry();
        let token = RequestId::new();
        ticket.set_pending(token);
        self.metrics.record_join_retry();

        let delay = backoff_delay(base, retry);
        info!(
            "Ticket {} retrying join of {} in {:?} (retry {}/{})",
            ticket_id, session_id, delay, retry, max_retries
        );

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(ActorMessage::RetryJoin { ticket_id, token });
            }
        });
        true
    }

    fn on_retry_join(&mut self, ticket_id: TicketId, token: RequestId) {
        let session_id = match self.machine.ticket_mut(ticket_id) {
            Some(ticket) if ticket.pending_request() == Some(token) => {
                ticket.clear_pending();
                ticket.current_candidate().map(|candidate| candidate.id.clone())
            }
            _ => {
                debug!("Retry timer for ticket {} no longer wanted", ticket_id);
                return;
            }
        };

        match session_id {
            Some(session_id) => self.send_join(ticket_id, session_id),
            None => error!("Ticket {} retry without a current candidate", ticket_id),
        }
    }

    fn on_create_completed(&mut self, response: AdapterResponse) -> Result<()> {
        match response.outcome {
            Ok(ResponseData::Created(session)) => {
                let ticket_id = self
                    .machine
                    .ticket_id()
                    .ok_or(MatchmakingError::InternalError {
                        message: "create completed without a ticket".to_string(),
                    })?;
                info!("Ticket {} created session {}", ticket_id, session.id);
                self.enter_session(ticket_id, session, TransitionReason::Created)
            }
            Ok(other) => Err(unexpected_payload("create", &other)),
            Err(failure) => self.on_failure(failure),
        }
    }

    fn on_leave_completed(&mut self, response: AdapterResponse) -> Result<()> {
        if let Err(failure) = &response.outcome {
            warn!("Leave failed, leaving locally anyway: {}", failure);
        }
        self.transition(MatchmakingState::Idle, TransitionReason::LeaveCompleted)?;
        self.resolve_leave();
        Ok(())
    }

    fn on_session_reply(
        &mut self,
        ticket_id: TicketId,
        response: AdapterResponse,
        reply: SessionReply,
    ) {
        match (response.outcome, reply) {
            (Ok(ResponseData::Updated(session)), SessionReply::Descriptor(reply)) => {
                if let Some(ticket) = self.machine.ticket_mut(ticket_id) {
                    let same_session = ticket
                        .session()
                        .map(|current| current.id == session.id)
                        .unwrap_or(false);
                    if ticket.state() == MatchmakingState::InSession && same_session {
                        ticket.set_session(session.clone());
                    }
                }
                info!("Session {} attributes updated", session.id);
                let _ = reply.send(Ok(session));
            }
            (Ok(ResponseData::Roster(roster)), SessionReply::Roster(reply)) => {
                self.apply_roster(roster.clone());
                let _ = reply.send(Ok(roster));
            }
            (Ok(other), reply) => reply.fail(unexpected_payload("session request", &other)),
            (Err(failure), reply) => {
                warn!("Session request failed: {}", failure);
                reply.fail(failure.into());
            }
        }
    }

    fn on_search_timeout(&mut self, ticket_id: TicketId, request_id: RequestId) {
        let timed_out = match self.machine.ticket_mut(ticket_id) {
            Some(ticket) if ticket.state() == MatchmakingState::Searching => {
                ticket.take_pending(request_id)
            }
            _ => false,
        };
        if !timed_out {
            return;
        }

        warn!("Ticket {} search timed out", ticket_id);
        self.adapter.abandon(request_id);
        let failure = Failure::with_diagnostic(ErrorKind::NetworkUnavailable, "search timed out");
        if let Err(e) = self.on_failure(failure) {
            error!("Ticket {} failed to apply search timeout: {}", ticket_id, e);
        }
    }

    fn on_session_invalidated(&mut self, session_id: SessionId) {
        let affected = self
            .machine
            .active()
            .filter(|ticket| ticket.state() == MatchmakingState::InSession)
            .and_then(|ticket| ticket.session())
            .map(|session| session.id == session_id)
            .unwrap_or(false);
        if !affected {
            return;
        }

        info!("Session {} invalidated by backend", session_id);
        let result = self
            .transition(MatchmakingState::Leaving, TransitionReason::SessionInvalidated)
            .and_then(|_| self.transition(MatchmakingState::Idle, TransitionReason::LeaveCompleted));
        if let Err(e) = result {
            error!("Failed to apply invalidation of {}: {}", session_id, e);
        }
    }

    /// Record a roster of the current session and publish what changed
    fn apply_roster(&mut self, roster: SessionRoster) {
        let Some(ticket) = self.machine.active_mut() else {
            return;
        };
        let current = ticket.state() == MatchmakingState::InSession
            && ticket.session().map(|session| &session.id) == Some(&roster.session_id);
        if !current || ticket.roster() == Some(&roster) {
            return;
        }

        let ticket_id = ticket.id();
        let was_ready = ticket.roster().map(SessionRoster::all_ready).unwrap_or(false);
        let address = roster.session_address.clone().filter(|address| {
            ticket.session().and_then(|session| session.host_address.as_deref())
                != Some(address.as_str())
        });
        if let Some(address) = &address {
            if let Some(mut session) = ticket.session().cloned() {
                session.host_address = Some(address.clone());
                ticket.set_session(session);
            }
        }
        ticket.set_roster(roster.clone());

        info!(
            "Ticket {} session {} has {} members, {} ready",
            ticket_id,
            roster.session_id,
            roster.len(),
            roster.ready_count()
        );
        let all_ready = roster.all_ready() && !was_ready;
        let session_id = roster.session_id.clone();
        let event = RosterEvent {
            ticket_id,
            roster,
            timestamp: current_timestamp(),
        };
        self.publisher
            .publish(MatchmakingEvent::RosterChanged(event.clone()));

        if let Some(address) = address {
            info!("Session {} address is now {}", session_id, address);
            self.publisher
                .publish(MatchmakingEvent::SessionAddressUpdated(SessionAddressEvent {
                    ticket_id,
                    session_id,
                    address,
                    timestamp: current_timestamp(),
                }));
        }

        if all_ready {
            info!("Ticket {}: all players ready", ticket_id);
            self.publisher.publish(MatchmakingEvent::AllPlayersReady(event));
        }
    }

    /// Classified failure of the pending operation of the active ticket
    fn on_failure(&mut self, failure: Failure) -> Result<()> {
        if failure.kind == ErrorKind::Cancelled {
            info!("Pending operation cancelled, returning to Idle");
            return self.transition(MatchmakingState::Idle, TransitionReason::Cancelled);
        }

        warn!("Ticket failed: {}", failure);
        let ticket_id = self.machine.ticket_id();
        self.transition(
            MatchmakingState::Failed,
            TransitionReason::OperationFailed {
                failure: failure.clone(),
            },
        )?;
        if let Some(ticket_id) = ticket_id {
            self.emit_result(ticket_id, TicketOutcome::Failed(failure));
        }
        Ok(())
    }

    /// No candidate left: create a session from the filters or fail
    fn fall_back_or_fail(&mut self, reason: TransitionReason) -> Result<()> {
        let (ticket_id, attributes) = match self.machine.active() {
            Some(ticket) => (ticket.id(), ticket.fallback_attributes().cloned()),
            None => return Ok(()),
        };

        match attributes {
            Some(attributes) if self.config.allow_fallback_create => {
                let capacity = self.config.default_capacity;
                info!(
                    "Ticket {} falling back to creating a session ({:?})",
                    ticket_id, reason
                );
                self.transition(MatchmakingState::Creating, reason)?;
                self.dispatch(ticket_id, |adapter, continuation| {
                    adapter.create(attributes, capacity, continuation)
                });
                Ok(())
            }
            _ => self.on_failure(Failure::new(ErrorKind::NoSessionsAndCreateDisabled)),
        }
    }

    fn enter_session(
        &mut self,
        ticket_id: TicketId,
        session: SessionDescriptor,
        reason: TransitionReason,
    ) -> Result<()> {
        if let Some(ticket) = self.machine.ticket_mut(ticket_id) {
            ticket.set_session(session.clone());
        }
        self.transition(MatchmakingState::InSession, reason)?;
        self.emit_result(ticket_id, TicketOutcome::InSession(session));
        Ok(())
    }

    fn record_attempt(&mut self, ticket_id: TicketId, outcome: JoinOutcome) {
        if let Some(ticket) = self.machine.ticket_mut(ticket_id) {
            if ticket.record_attempt(outcome).is_some() {
                self.metrics.record_join_attempt(outcome);
            }
        }
    }

    fn transition(&mut self, to: MatchmakingState, reason: TransitionReason) -> Result<()> {
        let event = self.machine.transition(to, reason)?;
        self.emit(event);
        Ok(())
    }

    fn emit(&self, event: TransitionEvent) {
        info!(
            "Ticket {} transition: {} -> {}",
            event.ticket_id, event.from, event.to
        );
        self.metrics.record_transition(event.to);
        self.publisher.publish(MatchmakingEvent::Transition(event));
    }

    fn emit_result(&self, ticket_id: TicketId, outcome: TicketOutcome) {
        self.metrics.record_ticket_outcome(&outcome);
        self.publisher.publish(MatchmakingEvent::Result(TicketResult {
            ticket_id,
            outcome,
            timestamp: current_timestamp(),
        }));
    }

    fn resolve_leave(&mut self) {
        if let Some(signal) = self.leave.take() {
            let _ = signal.sender.send(true);
        }
    }

    /// Dispatch an adapter request whose completion the active ticket waits on
    fn dispatch<F>(&mut self, ticket_id: TicketId, submit: F) -> RequestId
    where
        F: FnOnce(&SessionAdapter, Continuation) -> RequestId,
    {
        let request_id = self.dispatch_untracked(ticket_id, submit);
        if let Some(ticket) = self.machine.ticket_mut(ticket_id) {
            ticket.set_pending(request_id);
        }
        request_id
    }

    fn dispatch_untracked<F>(&self, ticket_id: TicketId, submit: F) -> RequestId
    where
        F: FnOnce(&SessionAdapter, Continuation) -> RequestId,
    {
        let sender = self.sender.clone();
        let continuation: Continuation = Box::new(move |response| {
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(ActorMessage::Completion {
                    ticket_id,
                    response,
                });
            }
        });
        submit(&self.adapter, continuation)
    }

    fn arm_search_timeout(&self, ticket_id: TicketId, request_id: RequestId) {
        let timeout = self.config.search_timeout;
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(ActorMessage::SearchTimeout {
                    ticket_id,
                    request_id,
                });
            }
        });
    }

    fn apply_default_bucket(&self, attributes: &mut Attributes) {
        attributes
            .entry(BUCKET_ATTRIBUTE.to_string())
            .or_insert_with(|| self.config.default_bucket.clone().into());
    }

    /// Drop a completion nobody waits on, leaving any session it joined
    fn disregard(&mut self, ticket_id: TicketId, response: AdapterResponse) {
        self.metrics.record_disregarded_completion();
        debug!(
            "Disregarding completion {} for ticket {}",
            response.request_id, ticket_id
        );

        let orphan = match &response.outcome {
            Ok(ResponseData::Joined(session)) | Ok(ResponseData::Created(session)) => {
                session.id.clone()
            }
            _ => return,
        };

        if self.is_current_session(&orphan) {
            return;
        }

        info!("Leaving orphaned session {} from ticket {}", orphan, ticket_id);
        self.adapter.leave(
            orphan,
            Box::new(|response: AdapterResponse| {
                if let Err(failure) = response.outcome {
                    debug!("Orphaned session cleanup failed: {}", failure);
                }
            }),
        );
    }

    /// Whether the active ticket is in, or joining, the given session
    fn is_current_session(&self, session_id: &SessionId) -> bool {
        self.machine
            .active()
            .map(|ticket| {
                ticket.session().map(|s| &s.id) == Some(session_id)
                    || (ticket.state() == MatchmakingState::Joining
                        && ticket.current_candidate().map(|c| &c.id) == Some(session_id))
            })
            .unwrap_or(false)
    }
}

/// Next backend notice; pends forever once the backend has none to send
async fn next_notice<T: Clone>(
    notices: &mut Option<broadcast::Receiver<T>>,
    label: &str,
) -> Option<T> {
    let Some(receiver) = notices.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match receiver.recv().await {
            Ok(notice) => return Some(notice),
            Err(RecvError::Lagged(skipped)) => warn!("Missed {} {} notices", skipped, label),
            Err(RecvError::Closed) => break,
        }
    }

    *notices = None;
    None
}

fn unexpected_payload(operation: &str, data: &ResponseData) -> anyhow::Error {
    MatchmakingError::InternalError {
        message: format!("unexpected {} payload: {:?}", operation, data),
    }
    .into()
}
