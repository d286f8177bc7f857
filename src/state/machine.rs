//! Matchmaking state machine and transition rules
//!
//! The machine owns the single active-ticket slot of a local player. Every
//! state change goes through [`StateMachine::transition`], which rejects
//! edges that are not in the transition table and returns the event that
//! the caller is expected to publish.

use crate::error::{Failure, MatchmakingError, Result};
use crate::state::ticket::{MatchmakingTicket, TicketIntent};
use crate::types::{TicketId, TransitionEvent, TransitionReason};
use crate::utils::current_timestamp;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Possible states of the local matchmaking client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchmakingState {
    /// Resting state between tickets
    Idle,
    /// Waiting for a search to complete
    Searching,
    /// Picking the next candidate to join
    EvaluatingCandidates,
    /// Waiting for a join to complete
    Joining,
    /// Waiting for a create to complete
    Creating,
    /// Member of a session (terminal success for a ticket)
    InSession,
    /// Waiting for a leave to complete
    Leaving,
    /// Ticket failed (terminal failure, cleared by acknowledgement)
    Failed,
}

impl MatchmakingState {
    /// Terminal states for a ticket
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchmakingState::InSession | MatchmakingState::Failed)
    }

    /// States a UI presents as progress
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            MatchmakingState::Searching
                | MatchmakingState::EvaluatingCandidates
                | MatchmakingState::Joining
                | MatchmakingState::Creating
        )
    }
}

impl std::fmt::Display for MatchmakingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MatchmakingState::Idle => "Idle",
            MatchmakingState::Searching => "Searching",
            MatchmakingState::EvaluatingCandidates => "EvaluatingCandidates",
            MatchmakingState::Joining => "Joining",
            MatchmakingState::Creating => "Creating",
            MatchmakingState::InSession => "InSession",
            MatchmakingState::Leaving => "Leaving",
            MatchmakingState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Check whether `from -> to` is an edge of the transition table
pub fn is_legal_transition(from: MatchmakingState, to: MatchmakingState) -> bool {
    use MatchmakingState::*;

    match (from, to) {
        (Idle, Searching) | (Idle, Creating) => true,
        (Searching, EvaluatingCandidates) | (Searching, Creating) | (Searching, Failed) => true,
        (EvaluatingCandidates, Joining) => true,
        (Joining, InSession)
        | (Joining, EvaluatingCandidates)
        | (Joining, Creating)
        | (Joining, Failed) => true,
        (Creating, InSession) | (Creating, Failed) => true,
        (InSession, Leaving) => true,
        (Leaving, Idle) => true,
        (Failed, Idle) => true,
        // Cancellation from any in-progress state
        (from, Idle) => from.is_progress(),
        _ => false,
    }
}

/// Owner of the active-ticket slot
#[derive(Debug, Default)]
pub struct StateMachine {
    active: Option<MatchmakingTicket>,
    last_failure: Option<Failure>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; `Idle` when no ticket is active
    pub fn state(&self) -> MatchmakingState {
        self.active
            .as_ref()
            .map(|ticket| ticket.state())
            .unwrap_or(MatchmakingState::Idle)
    }

    pub fn active(&self) -> Option<&MatchmakingTicket> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut MatchmakingTicket> {
        self.active.as_mut()
    }

    /// Active ticket if it has the given id
    pub fn ticket_mut(&mut self, ticket_id: TicketId) -> Option<&mut MatchmakingTicket> {
        self.active
            .as_mut()
            .filter(|ticket| ticket.id() == ticket_id)
    }

    pub fn ticket_id(&self) -> Option<TicketId> {
        self.active.as_ref().map(|ticket| ticket.id())
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    /// Drop the active ticket without emitting a transition
    pub fn clear(&mut self) -> Option<MatchmakingTicket> {
        self.active.take()
    }

    /// Occupy the slot with a new ticket and move it out of `Idle`.
    ///
    /// Fails with [`MatchmakingError::Busy`] while another ticket is active,
    /// whatever state it is in.
    pub fn begin(
        &mut self,
        intent: TicketIntent,
        to: MatchmakingState,
        reason: TransitionReason,
    ) -> Result<TransitionEvent> {
        if let Some(ticket) = &self.active {
            return Err(MatchmakingError::Busy {
                ticket_id: ticket.id(),
                state: ticket.state().to_string(),
            }
            .into());
        }

        if !is_legal_transition(MatchmakingState::Idle, to) {
            return Err(MatchmakingError::InvalidTransition {
                from: MatchmakingState::Idle.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let mut ticket = MatchmakingTicket::new(intent);
        ticket.set_state(to);
        let ticket_id = ticket.id();
        self.active = Some(ticket);
        self.last_failure = None;

        debug!("Ticket {} started: Idle -> {}", ticket_id, to);

        Ok(TransitionEvent {
            ticket_id,
            from: MatchmakingState::Idle,
            to,
            reason: Some(reason),
            timestamp: current_timestamp(),
        })
    }

    /// Move the active ticket to `to`.
    ///
    /// Reaching `Idle` retires the ticket and frees the slot.
    pub fn transition(
        &mut self,
        to: MatchmakingState,
        reason: TransitionReason,
    ) -> Result<TransitionEvent> {
        let ticket = self
            .active
            .as_mut()
            .ok_or_else(|| MatchmakingError::InvalidState {
                state: MatchmakingState::Idle.to_string(),
                operation: format!("transition to {}", to),
            })?;

        let from = ticket.state();
        if !is_legal_transition(from, to) {
            return Err(MatchmakingError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        ticket.set_state(to);
        let ticket_id = ticket.id();

        if let TransitionReason::OperationFailed { failure } = &reason {
            ticket.set_failure(failure.clone());
        }

        if to == MatchmakingState::Idle {
            if let Some(retired) = self.active.take() {
                self.last_failure = retired.failure().cloned();
            }
        }

        debug!("Ticket {} transition: {} -> {}", ticket_id, from, to);

        Ok(TransitionEvent {
            ticket_id,
            from,
            to,
            reason: Some(reason),
            timestamp: current_timestamp(),
        })
    }
}
