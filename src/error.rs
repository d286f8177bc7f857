//! Error types for the matchmaking client
//!
//! Operations return `anyhow::Result` like the rest of the crate. Failures a
//! caller is expected to react to are raised as [`MatchmakingError`] and can be
//! recovered with `downcast_ref`. [`ErrorKind`] is the classified taxonomy that
//! travels inside events and adapter responses.

use crate::types::TicketId;
use serde::{Deserialize, Serialize};

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Classified failure kinds shared by the adapter, the orchestrator and observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transient connectivity problem, retried for joins
    NetworkUnavailable,
    /// Session no longer exists on the backend
    NotFound,
    /// Session has no free slot
    Full,
    /// Backend refused the operation for this user
    PermissionDenied,
    /// Any other backend failure
    BackendError,
    /// A ticket is already active for this player
    Busy,
    /// Operation abandoned by the caller or by adapter shutdown
    Cancelled,
    /// No joinable session was found and fallback creation is disabled
    NoSessionsAndCreateDisabled,
}

impl ErrorKind {
    /// Candidate-level failures move on to the next candidate
    pub fn is_candidate_level(&self) -> bool {
        matches!(self, ErrorKind::Full | ErrorKind::NotFound)
    }

    /// Transient failures may be retried against the same target
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::NetworkUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NetworkUnavailable => "NetworkUnavailable",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Full => "Full",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::BackendError => "BackendError",
            ErrorKind::Busy => "Busy",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::NoSessionsAndCreateDisabled => "NoSessionsAndCreateDisabled",
        };
        write!(f, "{}", name)
    }
}

/// A classified failure with an optional opaque diagnostic from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub diagnostic: Option<String>,
}

impl Failure {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.diagnostic {
            Some(diagnostic) => write!(f, "{}: {}", self.kind, diagnostic),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Failure {}

impl From<ErrorKind> for Failure {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Matchmaking busy: ticket {ticket_id} is active in state {state}")]
    Busy { ticket_id: TicketId, state: String },

    #[error("No joinable sessions and fallback creation is disabled")]
    NoSessionsAndCreateDisabled,

    #[error("Ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: TicketId },

    #[error("Illegal state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation not valid in state {state}: {operation}")]
    InvalidState { state: String, operation: String },

    #[error("Matchmaking has been shut down")]
    ShutDown,

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal matchmaking error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Taxonomy kind for errors that map onto one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            MatchmakingError::Busy { .. } => Some(ErrorKind::Busy),
            MatchmakingError::NoSessionsAndCreateDisabled => {
                Some(ErrorKind::NoSessionsAndCreateDisabled)
            }
            MatchmakingError::ShutDown => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        assert_eq!(Failure::new(ErrorKind::Full).to_string(), "Full");
        assert_eq!(
            Failure::with_diagnostic(ErrorKind::BackendError, "code 42").to_string(),
            "BackendError: code 42"
        );
    }

    #[test]
    fn test_kind_classification() {
        assert!(ErrorKind::Full.is_candidate_level());
        assert!(ErrorKind::NotFound.is_candidate_level());
        assert!(!ErrorKind::PermissionDenied.is_candidate_level());
        assert!(ErrorKind::NetworkUnavailable.is_transient());
        assert!(!ErrorKind::BackendError.is_transient());
    }

    #[test]
    fn test_busy_downcast() {
        let err: anyhow::Error = MatchmakingError::Busy {
            ticket_id: TicketId::new(),
            state: "Searching".to_string(),
        }
        .into();
        let matchmaking = err.downcast_ref::<MatchmakingError>().unwrap();
        assert_eq!(matchmaking.kind(), Some(ErrorKind::Busy));
    }
}
