//! Search/join orchestration
//!
//! [`Matchmaker`] is the entry point: it spawns the per-player actor that
//! drives search, candidate ranking, joins with retry and fallback creation
//! on top of the session adapter and the state machine.

mod actor;
pub mod handle;
pub mod ranking;

pub use actor::PendingLeave;
pub use handle::{default_ordering, Matchmaker};
pub use ranking::rank_candidates;
