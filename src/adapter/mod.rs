//! Session backend adapter
//!
//! Translates backend calls and result codes into uniform
//! [`AdapterResponse`]s delivered through continuations.

pub mod request;
pub mod session;

pub use request::{AdapterRequest, AdapterResponse, Continuation, Operation, ResponseData};
pub use session::{classify, SessionAdapter};
