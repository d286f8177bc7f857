//! Metrics for the matchmaking client

pub mod collector;

pub use collector::{AdapterMetrics, MetricsCollector, MetricsTimer, TicketMetrics};
