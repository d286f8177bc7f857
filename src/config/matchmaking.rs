//! Runtime matchmaking policy handed to the orchestrator

use crate::config::app::MatchmakingSettings;
use std::time::Duration;

/// Orchestrator policy with durations resolved
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    pub allow_fallback_create: bool,
    pub max_search_results: usize,
    pub network_retry_backoff: Duration,
    pub max_network_retries: u32,
    pub search_timeout: Duration,
    pub default_capacity: u32,
    pub default_bucket: String,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self::from(&MatchmakingSettings::default())
    }
}

impl From<&MatchmakingSettings> for MatchmakingConfig {
    fn from(settings: &MatchmakingSettings) -> Self {
        Self {
            allow_fallback_create: settings.allow_fallback_create,
            max_search_results: settings.max_search_results,
            network_retry_backoff: Duration::from_millis(settings.network_retry_backoff_ms),
            max_network_retries: settings.max_network_retries,
            search_timeout: Duration::from_millis(settings.search_timeout_ms),
            default_capacity: settings.default_capacity,
            default_bucket: settings.default_bucket.clone(),
        }
    }
}

impl MatchmakingConfig {
    pub fn without_fallback_create(mut self) -> Self {
        self.allow_fallback_create = false;
        self
    }

    pub fn with_network_retry_backoff(mut self, backoff: Duration) -> Self {
        self.network_retry_backoff = backoff;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }
}
