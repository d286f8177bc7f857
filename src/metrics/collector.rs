//! Metrics collection using Prometheus
//!
//! Ticket-level metrics are recorded by the orchestrator, adapter-level
//! metrics by the session adapter. Both share one registry so a single
//! [`MetricsCollector::gather_text`] call renders everything.

use crate::error::Result;
use crate::state::MatchmakingState;
use crate::types::{JoinOutcome, TicketOutcome};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking client
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    ticket_metrics: TicketMetrics,
    adapter_metrics: AdapterMetrics,
}

/// Ticket lifecycle metrics
#[derive(Clone)]
pub struct TicketMetrics {
    /// Tickets started, by intent
    pub tickets_started_total: IntCounterVec,

    /// Terminal outcomes, by outcome
    pub ticket_outcomes_total: IntCounterVec,

    /// Transitions, by target state
    pub transitions_total: IntCounterVec,

    /// Join attempts, by outcome
    pub join_attempts_total: IntCounterVec,

    pub join_retries_total: IntCounter,

    /// Completions dropped because their ticket moved on
    pub disregarded_completions_total: IntCounter,

    /// 1 while a ticket occupies the slot
    pub active_tickets: IntGauge,
}

/// Session adapter metrics
#[derive(Clone)]
pub struct AdapterMetrics {
    /// Requests dispatched to the backend, by operation
    pub requests_total: IntCounterVec,

    /// Searches answered by an identical in-flight search
    pub deduplicated_searches_total: IntCounter,

    pub search_duration: Histogram,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let ticket_metrics = TicketMetrics::new(&registry)?;
        let adapter_metrics = AdapterMetrics::new(&registry)?;

        Ok(Self {
            registry,
            ticket_metrics,
            adapter_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn tickets(&self) -> &TicketMetrics {
        &self.ticket_metrics
    }

    pub fn adapter(&self) -> &AdapterMetrics {
        &self.adapter_metrics
    }

    pub fn record_ticket_started(&self, intent: &str) {
        self.ticket_metrics
            .tickets_started_total
            .with_label_values(&[intent])
            .inc();
        self.ticket_metrics.active_tickets.set(1);
    }

    pub fn record_ticket_outcome(&self, outcome: &TicketOutcome) {
        let label = match outcome {
            TicketOutcome::InSession(_) => "in_session",
            TicketOutcome::Failed(_) => "failed",
        };
        self.ticket_metrics
            .ticket_outcomes_total
            .with_label_values(&[label])
            .inc();
    }

    pub fn record_transition(&self, to: MatchmakingState) {
        self.ticket_metrics
            .transitions_total
            .with_label_values(&[&to.to_string()])
            .inc();

        if to == MatchmakingState::Idle {
            self.ticket_metrics.active_tickets.set(0);
        }
    }

    pub fn record_join_attempt(&self, outcome: JoinOutcome) {
        let label = match outcome {
            JoinOutcome::Success => "success",
            JoinOutcome::Full => "full",
            JoinOutcome::NotFound => "not_found",
            JoinOutcome::NetworkTimeout => "network_timeout",
            JoinOutcome::PermissionDenied => "permission_denied",
            JoinOutcome::BackendError => "backend_error",
        };
        self.ticket_metrics
            .join_attempts_total
            .with_label_values(&[label])
            .inc();
    }

    pub fn record_join_retry(&self) {
        self.ticket_metrics.join_retries_total.inc();
    }

    pub fn record_disregarded_completion(&self) {
        self.ticket_metrics.disregarded_completions_total.inc();
    }

    pub fn record_request(&self, operation: &str) {
        self.adapter_metrics
            .requests_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_search_deduplicated(&self) {
        self.adapter_metrics.deduplicated_searches_total.inc();
    }

    pub fn record_search_duration(&self, duration: Duration) {
        self.adapter_metrics
            .search_duration
            .observe(duration.as_secs_f64());
    }

    /// Render every registered metric in the text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl TicketMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let tickets_started_total = IntCounterVec::new(
            Opts::new("lobby_client_tickets_started_total", "Tickets started"),
            &["intent"],
        )?;
        registry.register(Box::new(tickets_started_total.clone()))?;

        let ticket_outcomes_total = IntCounterVec::new(
            Opts::new(
                "lobby_client_ticket_outcomes_total",
                "Terminal ticket outcomes",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(ticket_outcomes_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new("lobby_client_transitions_total", "State transitions"),
            &["to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let join_attempts_total = IntCounterVec::new(
            Opts::new("lobby_client_join_attempts_total", "Join attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(join_attempts_total.clone()))?;

        let join_retries_total =
            IntCounter::new("lobby_client_join_retries_total", "Join retries")?;
        registry.register(Box::new(join_retries_total.clone()))?;

        let disregarded_completions_total = IntCounter::new(
            "lobby_client_disregarded_completions_total",
            "Adapter completions dropped after their ticket moved on",
        )?;
        registry.register(Box::new(disregarded_completions_total.clone()))?;

        let active_tickets =
            IntGauge::new("lobby_client_active_tickets", "Active matchmaking tickets")?;
        registry.register(Box::new(active_tickets.clone()))?;

        Ok(Self {
            tickets_started_total,
            ticket_outcomes_total,
            transitions_total,
            join_attempts_total,
            join_retries_total,
            disregarded_completions_total,
            active_tickets,
        })
    }
}

impl AdapterMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "lobby_client_adapter_requests_total",
                "Backend requests dispatched",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let deduplicated_searches_total = IntCounter::new(
            "lobby_client_deduplicated_searches_total",
            "Searches joined to an identical in-flight search",
        )?;
        registry.register(Box::new(deduplicated_searches_total.clone()))?;

        let search_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lobby_client_search_duration_seconds",
                "Backend search duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(search_duration.clone()))?;

        Ok(Self {
            requests_total,
            deduplicated_searches_total,
            search_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
