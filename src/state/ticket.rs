//! Matchmaking ticket: one in-flight user intent
//!
//! A ticket carries everything the orchestrator needs to drive one intent:
//! the ranked candidates from its own search, the cursor into them, the join
//! attempt records and the id of the adapter request it is waiting on.
//! Candidates never outlive their ticket.

use crate::error::Failure;
use crate::state::machine::MatchmakingState;
use crate::types::{
    Attributes, JoinAttemptRecord, JoinOutcome, RequestId, SessionDescriptor, SessionId,
    SessionRoster, TicketId,
};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TicketIntent {
    /// Search, join the best candidate, fall back to creating
    QuickMatch { filters: Attributes },
    /// Create a session directly
    Create { attributes: Attributes, capacity: u32 },
}

impl TicketIntent {
    pub fn label(&self) -> &'static str {
        match self {
            TicketIntent::QuickMatch { .. } => "quick_match",
            TicketIntent::Create { .. } => "create",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchmakingTicket {
    id: TicketId,
    intent: TicketIntent,
    state: MatchmakingState,
    candidates: Vec<SessionDescriptor>,
    source_search: Option<RequestId>,
    candidate_cursor: Option<usize>,
    retry_count: u32,
    attempts: Vec<JoinAttemptRecord>,
    pending_request: Option<RequestId>,
    session: Option<SessionDescriptor>,
    roster: Option<SessionRoster>,
    failure: Option<Failure>,
    created_at: DateTime<Utc>,
}

impl MatchmakingTicket {
    pub fn new(intent: TicketIntent) -> Self {
        Self {
            id: TicketId::new(),
            intent,
            state: MatchmakingState::Idle,
            candidates: Vec::new(),
            source_search: None,
            candidate_cursor: None,
            retry_count: 0,
            attempts: Vec::new(),
            pending_request: None,
            session: None,
            roster: None,
            failure: None,
            created_at: current_timestamp(),
        }
    }

    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn intent(&self) -> &TicketIntent {
        &self.intent
    }

    pub fn state(&self) -> MatchmakingState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: MatchmakingState) {
        self.state = state;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn candidates(&self) -> &[SessionDescriptor] {
        &self.candidates
    }

    pub fn candidate_cursor(&self) -> Option<usize> {
        self.candidate_cursor
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn attempts(&self) -> &[JoinAttemptRecord] {
        &self.attempts
    }

    pub fn session(&self) -> Option<&SessionDescriptor> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: SessionDescriptor) {
        if self.session.as_ref().map(|current| &current.id) != Some(&session.id) {
            self.roster = None;
        }
        self.session = Some(session);
    }

    /// Last roster seen for the current session
    pub fn roster(&self) -> Option<&SessionRoster> {
        self.roster.as_ref()
    }

    pub fn set_roster(&mut self, roster: SessionRoster) {
        self.roster = Some(roster);
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub(crate) fn set_failure(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    /// Store the ranked candidates of this ticket's search
    pub fn set_candidates(&mut self, candidates: Vec<SessionDescriptor>, source_search: RequestId) {
        self.candidates = candidates;
        self.source_search = Some(source_search);
        self.candidate_cursor = None;
        self.retry_count = 0;
    }

    pub fn attempt_for(&self, session_id: &SessionId) -> Option<&JoinAttemptRecord> {
        self.attempts
            .iter()
            .find(|record| &record.session_id == session_id)
    }

    /// Highest-ranked candidate without an attempt record
    pub fn next_candidate(&self) -> Option<(usize, &SessionDescriptor)> {
        self.candidates
            .iter()
            .enumerate()
            .find(|(_, candidate)| self.attempt_for(&candidate.id).is_none())
    }

    pub fn has_untried_candidates(&self) -> bool {
        self.next_candidate().is_some()
    }

    /// Point the cursor at a candidate and reset its retry count
    pub fn select_candidate(&mut self, index: usize) -> Option<&SessionDescriptor> {
        if index >= self.candidates.len() {
            return None;
        }
        self.candidate_cursor = Some(index);
        self.retry_count = 0;
        self.candidates.get(index)
    }

    pub fn current_candidate(&self) -> Option<&SessionDescriptor> {
        self.candidate_cursor
            .and_then(|index| self.candidates.get(index))
    }

    /// Count one retry against the current candidate, returning the new count
    pub fn note_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Record the final outcome for the current candidate.
    ///
    /// A candidate has at most one record; recording again overwrites it.
    pub fn record_attempt(&mut self, outcome: JoinOutcome) -> Option<&JoinAttemptRecord> {
        let index = self.candidate_cursor?;
        let session_id = self.candidates.get(index)?.id.clone();
        let source_search = self.source_search?;
        let record = JoinAttemptRecord {
            session_id: session_id.clone(),
            candidate_index: index,
            outcome,
            attempts: self.retry_count + 1,
            source_search,
            recorded_at: current_timestamp(),
        };

        match self
            .attempts
            .iter()
            .position(|existing| existing.session_id == session_id)
        {
            Some(position) => {
                self.attempts[position] = record;
                self.attempts.get(position)
            }
            None => {
                self.attempts.push(record);
                self.attempts.last()
            }
        }
    }

    pub fn pending_request(&self) -> Option<RequestId> {
        self.pending_request
    }

    pub fn set_pending(&mut self, request_id: RequestId) {
        self.pending_request = Some(request_id);
    }

    /// Clear the pending request if it matches, returning whether it did
    pub fn take_pending(&mut self, request_id: RequestId) -> bool {
        if self.pending_request == Some(request_id) {
            self.pending_request = None;
            true
        } else {
            false
        }
    }

    pub fn clear_pending(&mut self) -> Option<RequestId> {
        self.pending_request.take()
    }

    /// Only quick-match tickets may fall back to creating a session
    pub fn fallback_attributes(&self) -> Option<&Attributes> {
        match &self.intent {
            TicketIntent::QuickMatch { filters } => Some(filters),
            TicketIntent::Create { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> SessionDescriptor {
        SessionDescriptor {
            id: SessionId::new(id),
            attributes: Attributes::new(),
            player_count: 1,
            capacity: 4,
            host_address: None,
        }
    }

    fn ticket_with_candidates(ids: &[&str]) -> MatchmakingTicket {
        let mut ticket = MatchmakingTicket::new(TicketIntent::QuickMatch {
            filters: Attributes::new(),
        });
        ticket.set_candidates(ids.iter().map(|id| candidate(id)).collect(), RequestId::new());
        ticket
    }

    #[test]
    fn test_next_candidate_prefers_highest_ranked_untried() {
        let mut ticket = ticket_with_candidates(&["a", "b", "c"]);
        assert_eq!(ticket.next_candidate().unwrap().0, 0);

        ticket.select_candidate(0);
        ticket.record_attempt(JoinOutcome::Full);
        let (index, next) = ticket.next_candidate().unwrap();
        assert_eq!(index, 1);
        assert_eq!(next.id.as_str(), "b");

        ticket.select_candidate(1);
        ticket.record_attempt(JoinOutcome::NotFound);
        ticket.select_candidate(2);
        ticket.record_attempt(JoinOutcome::NetworkTimeout);
        assert!(!ticket.has_untried_candidates());
    }

    #[test]
    fn test_record_attempt_never_duplicates() {
        let mut ticket = ticket_with_candidates(&["a"]);
        ticket.select_candidate(0);
        ticket.note_retry();
        ticket.record_attempt(JoinOutcome::NetworkTimeout);
        ticket.record_attempt(JoinOutcome::Success);

        assert_eq!(ticket.attempts().len(), 1);
        let record = &ticket.attempts()[0];
        assert_eq!(record.outcome, JoinOutcome::Success);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_record_attempt_requires_cursor() {
        let mut ticket = ticket_with_candidates(&["a"]);
        assert!(ticket.record_attempt(JoinOutcome::Full).is_none());
        assert!(ticket.attempts().is_empty());
    }

    #[test]
    fn test_select_candidate_resets_retries() {
        let mut ticket = ticket_with_candidates(&["a", "b"]);
        ticket.select_candidate(0);
        assert_eq!(ticket.note_retry(), 1);
        ticket.select_candidate(1);
        assert_eq!(ticket.retry_count(), 0);
        assert!(ticket.select_candidate(5).is_none());
        assert_eq!(ticket.current_candidate().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_pending_request_matching() {
        let mut ticket = ticket_with_candidates(&[]);
        let request = RequestId::new();
        ticket.set_pending(request);
        assert!(!ticket.take_pending(RequestId::new()));
        assert_eq!(ticket.pending_request(), Some(request));
        assert!(ticket.take_pending(request));
        assert_eq!(ticket.pending_request(), None);
    }

    #[test]
    fn test_fallback_only_for_quick_match() {
        let quick = ticket_with_candidates(&[]);
        assert!(quick.fallback_attributes().is_some());

        let create = MatchmakingTicket::new(TicketIntent::Create {
            attributes: Attributes::new(),
            capacity: 4,
        });
        assert!(create.fallback_attributes().is_none());
    }

    #[test]
    fn test_roster_dropped_when_session_changes() {
        let mut ticket = ticket_with_candidates(&[]);
        ticket.set_session(candidate("a"));
        ticket.set_roster(SessionRoster {
            session_id: SessionId::new("a"),
            members: Vec::new(),
            session_address: None,
        });

        let mut updated = candidate("a");
        updated.player_count = 2;
        ticket.set_session(updated);
        assert!(ticket.roster().is_some());

        ticket.set_session(candidate("b"));
        assert!(ticket.roster().is_none());
    }
}
