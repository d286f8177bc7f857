//! Local matchmaking state
//!
//! This module holds the state machine that enforces legal transitions and
//! the ticket type that represents one in-flight user intent.

pub mod machine;
pub mod ticket;

// Re-export commonly used types
pub use machine::{is_legal_transition, MatchmakingState, StateMachine};
pub use ticket::{MatchmakingTicket, TicketIntent};
