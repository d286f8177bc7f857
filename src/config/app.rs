//! Main application configuration
//!
//! This module defines the primary configuration structures for the lobby
//! client, including environment variable loading, TOML file loading and
//! validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub matchmaking: MatchmakingSettings,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Client name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Matchmaking policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Create a session when no candidate can be joined
    pub allow_fallback_create: bool,
    /// Maximum number of sessions requested per search
    pub max_search_results: usize,
    /// Base delay before retrying a join after a network failure
    pub network_retry_backoff_ms: u64,
    /// Join retries against the same candidate after network failures
    pub max_network_retries: u32,
    /// Time allowed for a search to complete
    pub search_timeout_ms: u64,
    /// Capacity used for fallback-created sessions
    pub default_capacity: u32,
    /// Bucket used when the caller does not set one
    pub default_bucket: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "lobby-client".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            allow_fallback_create: true,
            max_search_results: 50,
            network_retry_backoff_ms: 250,
            max_network_retries: 1,
            search_timeout_ms: 10_000, // 10 seconds
            default_capacity: 4,
            default_bucket: "GameSession".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }

        // Matchmaking settings
        if let Ok(allow) = env::var("ALLOW_FALLBACK_CREATE") {
            self.matchmaking.allow_fallback_create = allow
                .parse()
                .map_err(|_| anyhow!("Invalid ALLOW_FALLBACK_CREATE value: {}", allow))?;
        }
        if let Ok(max_results) = env::var("MAX_SEARCH_RESULTS") {
            self.matchmaking.max_search_results = max_results
                .parse()
                .map_err(|_| anyhow!("Invalid MAX_SEARCH_RESULTS value: {}", max_results))?;
        }
        if let Ok(backoff) = env::var("NETWORK_RETRY_BACKOFF_MS") {
            self.matchmaking.network_retry_backoff_ms = backoff
                .parse()
                .map_err(|_| anyhow!("Invalid NETWORK_RETRY_BACKOFF_MS value: {}", backoff))?;
        }
        if let Ok(retries) = env::var("MAX_NETWORK_RETRIES") {
            self.matchmaking.max_network_retries = retries
                .parse()
                .map_err(|_| anyhow!("Invalid MAX_NETWORK_RETRIES value: {}", retries))?;
        }
        if let Ok(timeout) = env::var("SEARCH_TIMEOUT_MS") {
            self.matchmaking.search_timeout_ms = timeout
                .parse()
                .map_err(|_| anyhow!("Invalid SEARCH_TIMEOUT_MS value: {}", timeout))?;
        }
        if let Ok(capacity) = env::var("DEFAULT_SESSION_CAPACITY") {
            self.matchmaking.default_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("Invalid DEFAULT_SESSION_CAPACITY value: {}", capacity))?;
        }
        if let Ok(bucket) = env::var("DEFAULT_BUCKET_ID") {
            self.matchmaking.default_bucket = bucket;
        }

        Ok(())
    }

    /// Get the network retry base delay as Duration
    pub fn network_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.matchmaking.network_retry_backoff_ms)
    }

    /// Get the search timeout as Duration
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.matchmaking.search_timeout_ms)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    // Validate matchmaking settings
    if config.matchmaking.max_search_results == 0 {
        return Err(anyhow!("Max search results must be greater than 0"));
    }
    if config.matchmaking.search_timeout_ms == 0 {
        return Err(anyhow!("Search timeout must be greater than 0"));
    }
    if config.matchmaking.default_capacity == 0 {
        return Err(anyhow!("Default session capacity must be greater than 0"));
    }
    if config.matchmaking.default_bucket.is_empty() {
        return Err(anyhow!("Default bucket cannot be empty"));
    }

    Ok(())
}
