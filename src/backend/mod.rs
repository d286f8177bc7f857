//! Session backend seam
//!
//! [`SessionBackend`] is the interface to the external session service, and
//! [`InMemorySessionService`] is the in-process implementation used by tests
//! and the CLI.

pub mod memory;
pub mod provider;

pub use memory::{InMemorySessionBackend, InMemorySessionService};
pub use provider::{BackendError, BackendOperation, BackendResultCode, SessionBackend};
