//! Common types used throughout the matchmaking client

use crate::error::Failure;
use crate::state::MatchmakingState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attribute key that scopes sessions into buckets
pub const BUCKET_ATTRIBUTE: &str = "bucket";

/// Attribute key used by region-first ordering
pub const REGION_ATTRIBUTE: &str = "region";

/// Sessions with this attribute set to `true` never appear in searches
pub const PRIVATE_ATTRIBUTE: &str = "private";

/// Opaque, backend-assigned session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unique identifier for a matchmaking ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one adapter request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of a session attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::Bool(value) => write!(f, "{}", value),
            AttributeValue::Int(value) => write!(f, "{}", value),
            AttributeValue::Text(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Attribute bag used for session metadata and search filters
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Published description of a session on the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub attributes: Attributes,
    pub player_count: u32,
    pub capacity: u32,
    /// Address of the game server hosting the session, if published
    pub host_address: Option<String>,
}

impl SessionDescriptor {
    pub fn is_full(&self) -> bool {
        self.player_count >= self.capacity
    }

    pub fn open_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.player_count)
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn is_private(&self) -> bool {
        self.attributes.get(PRIVATE_ATTRIBUTE) == Some(&AttributeValue::Bool(true))
    }

    /// Every filter must be present with an equal value
    pub fn matches(&self, filters: &Attributes) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }
}

/// One member of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMember {
    pub user_id: String,
    pub is_host: bool,
    pub ready: bool,
}

/// Members of a session and the address the host published for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRoster {
    pub session_id: SessionId,
    pub members: Vec<SessionMember>,
    pub session_address: Option<String>,
}

impl SessionRoster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.members.iter().filter(|member| member.ready).count()
    }

    /// Every member is ready; an empty roster never is
    pub fn all_ready(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|member| member.ready)
    }

    pub fn host(&self) -> Option<&SessionMember> {
        self.members.iter().find(|member| member.is_host)
    }

    pub fn member(&self, user_id: &str) -> Option<&SessionMember> {
        self.members.iter().find(|member| member.user_id == user_id)
    }
}

/// Ranking keys applied in order, later keys break ties of earlier ones
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderingPreference {
    /// Sessions whose region attribute equals the given region come first
    RegionFirst(String),
    /// Fuller sessions come first
    MostPopulated,
    /// Emptier sessions come first
    LeastPopulated,
}

/// Filters and ranking for one search
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub filters: Attributes,
    pub max_results: usize,
    pub ordering: Vec<OrderingPreference>,
}

impl SearchQuery {
    pub fn new(filters: Attributes, max_results: usize) -> Self {
        Self {
            filters,
            max_results,
            ordering: Vec::new(),
        }
    }

    pub fn with_ordering(mut self, ordering: Vec<OrderingPreference>) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }
}

/// Sessions returned by one completed search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: SearchQuery,
    pub sessions: Vec<SessionDescriptor>,
    pub completed_at: DateTime<Utc>,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Outcome of joining one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinOutcome {
    Success,
    Full,
    NotFound,
    NetworkTimeout,
    PermissionDenied,
    BackendError,
}

impl JoinOutcome {
    /// Candidates with these outcomes are never attempted again within a ticket
    pub fn excludes_candidate(&self) -> bool {
        matches!(self, JoinOutcome::Full | JoinOutcome::NotFound)
    }
}

impl From<crate::error::ErrorKind> for JoinOutcome {
    fn from(kind: crate::error::ErrorKind) -> Self {
        use crate::error::ErrorKind;
        match kind {
            ErrorKind::Full => JoinOutcome::Full,
            ErrorKind::NotFound => JoinOutcome::NotFound,
            ErrorKind::NetworkUnavailable => JoinOutcome::NetworkTimeout,
            ErrorKind::PermissionDenied => JoinOutcome::PermissionDenied,
            _ => JoinOutcome::BackendError,
        }
    }
}

/// Outcome of the join attempts made against one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAttemptRecord {
    pub session_id: SessionId,
    /// Position of the candidate in the ranked list
    pub candidate_index: usize,
    pub outcome: JoinOutcome,
    /// Number of join calls made, retries included
    pub attempts: u32,
    /// Search that produced the descriptor
    pub source_search: RequestId,
    pub recorded_at: DateTime<Utc>,
}

/// Why a transition happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason")]
pub enum TransitionReason {
    QuickMatchRequested,
    CreateRequested,
    CandidatesFound { count: usize },
    NoCandidates,
    CandidateSelected { session_id: SessionId },
    JoinFailed { session_id: SessionId, kind: crate::error::ErrorKind },
    CandidatesExhausted,
    Joined,
    Created,
    OperationFailed { failure: Failure },
    LeaveRequested,
    SessionInvalidated,
    LeaveCompleted,
    Cancelled,
    FailureAcknowledged,
}

/// Event emitted for every state transition of a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub ticket_id: TicketId,
    pub from: MatchmakingState,
    pub to: MatchmakingState,
    pub reason: Option<TransitionReason>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TicketOutcome {
    InSession(SessionDescriptor),
    Failed(Failure),
}

/// Event emitted once when a ticket reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketResult {
    pub ticket_id: TicketId,
    pub outcome: TicketOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Roster of the session a ticket is in, as of one backend notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEvent {
    pub ticket_id: TicketId,
    pub roster: SessionRoster,
    pub timestamp: DateTime<Utc>,
}

/// The host published a new game server address for the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAddressEvent {
    pub ticket_id: TicketId,
    pub session_id: SessionId,
    pub address: String,
    pub timestamp: DateTime<Utc>,
}

/// Union type for everything the publisher delivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchmakingEvent {
    Transition(TransitionEvent),
    Result(TicketResult),
    /// Members joined, left or changed their ready flag
    RosterChanged(RosterEvent),
    SessionAddressUpdated(SessionAddressEvent),
    /// Emitted when the roster becomes all-ready, not on every notice while it stays so
    AllPlayersReady(RosterEvent),
}

impl MatchmakingEvent {
    pub fn ticket_id(&self) -> TicketId {
        match self {
            MatchmakingEvent::Transition(event) => event.ticket_id,
            MatchmakingEvent::Result(result) => result.ticket_id,
            MatchmakingEvent::RosterChanged(event) | MatchmakingEvent::AllPlayersReady(event) => {
                event.ticket_id
            }
            MatchmakingEvent::SessionAddressUpdated(event) => event.ticket_id,
        }
    }

    pub fn as_transition(&self) -> Option<&TransitionEvent> {
        match self {
            MatchmakingEvent::Transition(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&TicketResult> {
        match self {
            MatchmakingEvent::Result(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_roster(&self) -> Option<&SessionRoster> {
        match self {
            MatchmakingEvent::RosterChanged(event) | MatchmakingEvent::AllPlayersReady(event) => {
                Some(&event.roster)
            }
            _ => None,
        }
    }
}

/// Snapshot of the local matchmaking status for polling UIs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchmakingStatus {
    pub state: MatchmakingState,
    pub ticket_id: Option<TicketId>,
    pub session: Option<SessionDescriptor>,
    /// Last roster notice received for the current session
    pub roster: Option<SessionRoster>,
    pub last_failure: Option<Failure>,
}
