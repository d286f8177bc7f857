//! Request and response shapes exchanged with the session adapter

use crate::error::{ErrorKind, Failure};
use crate::types::{
    Attributes, RequestId, SearchQuery, SearchResult, SessionDescriptor, SessionId, SessionRoster,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Backend operation and its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Create { attributes: Attributes, capacity: u32 },
    Search(SearchQuery),
    Join(SessionId),
    Leave(SessionId),
    UpdateAttributes {
        session_id: SessionId,
        attributes: Attributes,
    },
    Members(SessionId),
    SetReady {
        session_id: SessionId,
        ready: bool,
    },
    SetSessionAddress {
        session_id: SessionId,
        address: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Search(_) => "search",
            Operation::Join(_) => "join",
            Operation::Leave(_) => "leave",
            Operation::UpdateAttributes { .. } => "update_attributes",
            Operation::Members(_) => "members",
            Operation::SetReady { .. } => "set_ready",
            Operation::SetSessionAddress { .. } => "set_session_address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub request_id: RequestId,
    pub operation: Operation,
}

impl AdapterRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            request_id: RequestId::new(),
            operation,
        }
    }
}

/// Success payload of a completed request
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Created(SessionDescriptor),
    /// Shared with every caller of an identical concurrent search
    Found(Arc<SearchResult>),
    Joined(SessionDescriptor),
    Left,
    Updated(SessionDescriptor),
    Roster(SessionRoster),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResponse {
    pub request_id: RequestId,
    pub outcome: Result<ResponseData, Failure>,
}

impl AdapterResponse {
    pub fn ok(request_id: RequestId, data: ResponseData) -> Self {
        Self {
            request_id,
            outcome: Ok(data),
        }
    }

    pub fn failed(request_id: RequestId, failure: Failure) -> Self {
        Self {
            request_id,
            outcome: Err(failure),
        }
    }

    pub fn cancelled(request_id: RequestId) -> Self {
        Self::failed(request_id, Failure::cancelled())
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(|failure| failure.kind)
    }
}

/// Continuation invoked exactly once with the response of a request
pub type Continuation = Box<dyn FnOnce(AdapterResponse) + Send + 'static>;
