//! Utility functions for the matchmaking client

use crate::types::{AttributeValue, Attributes};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Delay before retry number `retry` (1-based): `base * 2^retry`.
///
/// The first retry already waits one doubling of the base delay.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << retry.min(16))
}

/// Parse a `key=value` pair into an attribute.
///
/// Integers and `true`/`false` are typed, everything else is text.
pub fn parse_attribute(pair: &str) -> Result<(String, AttributeValue)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid attribute '{}', expected key=value", pair))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Attribute key cannot be empty in '{}'", pair));
    }

    let value = value.trim();
    let value = if let Ok(int) = value.parse::<i64>() {
        AttributeValue::Int(int)
    } else if let Ok(flag) = value.parse::<bool>() {
        AttributeValue::Bool(flag)
    } else {
        AttributeValue::Text(value.to_string())
    };

    Ok((key.to_string(), value))
}

/// Parse a list of `key=value` pairs into an attribute bag
pub fn parse_attributes<S: AsRef<str>>(pairs: &[S]) -> Result<Attributes> {
    pairs
        .iter()
        .map(|pair| parse_attribute(pair.as_ref()))
        .collect()
}
