//! Lobby Client - client-side session matchmaking
//!
//! This crate discovers, joins and creates multiplayer sessions on a session
//! backend, drives each user intent through a matchmaking state machine and
//! publishes every transition to observers.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{ErrorKind, Failure, MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use adapter::SessionAdapter;
pub use backend::{InMemorySessionBackend, InMemorySessionService, SessionBackend};
pub use config::{AppConfig, MatchmakingConfig};
pub use events::{EventPublisher, MatchmakingObserver, RecordingObserver, SubscriptionHandle};
pub use orchestrator::{Matchmaker, PendingLeave};
pub use state::{MatchmakingState, StateMachine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
