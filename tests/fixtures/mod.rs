//! Shared fixtures for integration testing

#![allow(dead_code)]

use lobby_client::config::MatchmakingConfig;
use lobby_client::events::RecordingObserver;
use lobby_client::types::{
    Attributes, MatchmakingEvent, MatchmakingStatus, TicketResult, TransitionEvent,
};
use lobby_client::{InMemorySessionService, Matchmaker, MatchmakingState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Policy with short timers so retry tests run fast
pub fn test_config() -> MatchmakingConfig {
    MatchmakingConfig::default()
        .with_network_retry_backoff(Duration::from_millis(10))
        .with_search_timeout(Duration::from_secs(2))
}

pub fn ranked() -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("mode".to_string(), "ranked".into());
    attributes
}

/// Attributes a seeded session needs to match a quick match on `ranked()`
pub fn ranked_in_default_bucket() -> Attributes {
    let mut attributes = ranked();
    attributes.insert("bucket".to_string(), "GameSession".into());
    attributes
}

/// One local player wired to a shared in-memory service
pub struct TestClient {
    pub matchmaker: Matchmaker,
    pub recorder: Arc<RecordingObserver>,
    pub events: mpsc::UnboundedReceiver<MatchmakingEvent>,
}

impl TestClient {
    pub fn spawn(service: &Arc<InMemorySessionService>, user: &str, config: MatchmakingConfig) -> Self {
        let backend = Arc::new(service.connect(user));
        let matchmaker = Matchmaker::new(backend, config).expect("Failed to create matchmaker");
        let recorder = Arc::new(RecordingObserver::new());
        matchmaker.subscribe(recorder.clone());
        let (_, events) = matchmaker.subscribe_channel();

        Self {
            matchmaker,
            recorder,
            events,
        }
    }

    /// Next event, failing the test if none arrives in time
    pub async fn next_event(&mut self) -> MatchmakingEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("Timed out waiting for event")
            .expect("Event channel closed")
    }

    /// Consume events up to and including the next terminal result
    pub async fn next_result(&mut self) -> TicketResult {
        loop {
            if let MatchmakingEvent::Result(result) = self.next_event().await {
                return result;
            }
        }
    }

    /// Consume events until a transition into `state`
    pub async fn wait_for_transition(&mut self, state: MatchmakingState) -> TransitionEvent {
        loop {
            if let MatchmakingEvent::Transition(event) = self.next_event().await {
                if event.to == state {
                    return event;
                }
            }
        }
    }

    /// Consume events until one satisfies `predicate`
    pub async fn wait_for_event(
        &mut self,
        predicate: impl Fn(&MatchmakingEvent) -> bool,
    ) -> MatchmakingEvent {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Assert that no event arrives within `window`
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.events.recv()).await {
            panic!("Unexpected event: {:?}", event);
        }
    }

    pub async fn status(&self) -> MatchmakingStatus {
        self.matchmaker
            .current_status()
            .await
            .expect("Failed to query status")
    }

    /// Target states of every recorded transition, in order
    pub fn path(&self) -> Vec<MatchmakingState> {
        self.recorder
            .transitions()
            .iter()
            .map(|event| event.to)
            .collect()
    }
}

/// Poll `condition` until it holds or the event timeout passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
