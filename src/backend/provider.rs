//! Session backend interface
//!
//! This module defines the seam to the external session service. Backends
//! report failures with SDK-style result codes; the adapter classifies them
//! into the crate's error taxonomy.

use crate::types::{Attributes, SessionDescriptor, SessionId, SessionRoster};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Result codes reported by a session service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendResultCode {
    NoConnection,
    TimedOut,
    NotFound,
    SessionFull,
    InvalidUser,
    NoPermission,
    InvalidParameters,
    AlreadyPending,
    UnexpectedError,
}

impl std::fmt::Display for BackendResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failure reported by a session service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: BackendResultCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: BackendResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Operations a session service supports, used for fault injection and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendOperation {
    Create,
    Search,
    Join,
    Leave,
    Update,
    Members,
    SetReady,
    SetAddress,
}

impl BackendOperation {
    pub const ALL: [BackendOperation; 8] = [
        BackendOperation::Create,
        BackendOperation::Search,
        BackendOperation::Join,
        BackendOperation::Leave,
        BackendOperation::Update,
        BackendOperation::Members,
        BackendOperation::SetReady,
        BackendOperation::SetAddress,
    ];
}

/// Trait for the external session service, bound to one local user
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create and publish a session hosted by the local user
    async fn create_session(
        &self,
        attributes: Attributes,
        capacity: u32,
    ) -> Result<SessionDescriptor, BackendError>;

    /// Find sessions whose attributes match every filter
    async fn find_sessions(
        &self,
        filters: &Attributes,
        max_results: usize,
    ) -> Result<Vec<SessionDescriptor>, BackendError>;

    /// Join a session as the local user
    async fn join_session(&self, session_id: &SessionId)
        -> Result<SessionDescriptor, BackendError>;

    /// Leave a session; the session is destroyed when its host leaves
    async fn leave_session(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// Replace or add attributes on a session the local user hosts
    async fn update_session(
        &self,
        session_id: &SessionId,
        attributes: Attributes,
    ) -> Result<SessionDescriptor, BackendError>;

    /// Current members of a session the local user belongs to
    async fn session_members(&self, session_id: &SessionId) -> Result<SessionRoster, BackendError>;

    /// Set the local user's ready flag in a session
    async fn set_member_ready(
        &self,
        session_id: &SessionId,
        ready: bool,
    ) -> Result<SessionRoster, BackendError>;

    /// Publish the game server address of a session the local user hosts
    async fn set_session_address(
        &self,
        session_id: &SessionId,
        address: String,
    ) -> Result<SessionRoster, BackendError>;

    /// Notifications for sessions destroyed or evicted by the service
    fn invalidations(&self) -> Option<broadcast::Receiver<SessionId>> {
        None
    }

    /// Roster snapshots published whenever a session's members, ready flags
    /// or address change
    fn roster_updates(&self) -> Option<broadcast::Receiver<SessionRoster>> {
        None
    }
}
