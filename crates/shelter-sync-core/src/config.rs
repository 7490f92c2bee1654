//! ============================================================================
//! Sync Configuration - environment-driven settings
//! ============================================================================
//! Values come from the process environment (optionally seeded from a .env
//! file). Unparseable values, and a zero capacity or timeout, fall back to
//! the default with a warning.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::retry::RetryConfig;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the shelter REST API
    pub api_url: String,
    /// Bearer token forwarded untouched
    pub api_token: Option<String>,
    pub queue_capacity: usize,
    /// Timeout for each drained action's network call
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Queue journal location; None means the default under the home dir
    pub db_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryConfig::default(),
            db_path: None,
        }
    }
}

impl SyncConfig {
    /// Load `.env` (if present) and read the process environment
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup (env, map in tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let defaults_retry = defaults.retry.clone();

        Self {
            api_url: lookup("SHELTER_API_URL")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.api_url),
            api_token: lookup("SHELTER_API_TOKEN").filter(|s| !s.is_empty()),
            queue_capacity: parse_nonzero(&lookup, "SHELTER_QUEUE_CAPACITY", defaults.queue_capacity),
            request_timeout: Duration::from_secs(parse_nonzero(
                &lookup,
                "SHELTER_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            retry: RetryConfig {
                base_delay_ms: parse_or(&lookup, "SHELTER_RETRY_BASE_MS", defaults_retry.base_delay_ms),
                max_delay_ms: parse_or(&lookup, "SHELTER_RETRY_MAX_MS", defaults_retry.max_delay_ms),
                jitter: parse_or(&lookup, "SHELTER_RETRY_JITTER", defaults_retry.jitter),
            },
            db_path: lookup("SHELTER_SYNC_DB_PATH").map(PathBuf::from),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}='{}', using default {:?}", key, raw, default);
            default
        }),
        None => default,
    }
}

/// Like `parse_or`, but zero is rejected too
fn parse_nonzero<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + Default + PartialEq + std::fmt::Debug,
{
    let value = parse_or(lookup, key, default);
    if value == T::default() {
        warn!("{} must be greater than zero, using default {:?}", key, default);
        return default;
    }
    value
}
