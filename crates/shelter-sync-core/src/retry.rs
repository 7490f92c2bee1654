//! ============================================================================
//! Sync Retry Logic - Failure Classification & Exponential Backoff
//! ============================================================================
//! Decides whether a failed drain step may be retried and how long the
//! coordinator waits before trying the head action again:
//! - Exponential backoff (2s, 4s, 8s, ... capped at 60s) with optional jitter
//! - HTTP status classification (5xx/408 retryable, 429 rate limited, 4xx terminal)
//! - Transport error classification by message
//! ============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for blocked drains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First retry delay (multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay
    pub max_delay_ms: u64,
    /// Whether to add up to 50% random jitter (still capped)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transient (network, timeout, 5xx): keep the action and back off
    Retryable,
    /// Server asked us to slow down: back off the maximum delay
    RateLimited,
    /// Validation or conflict: retrying cannot help
    Terminal,
}

impl FailureKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureKind::Terminal)
    }
}

/// Classify an HTTP status code returned by the shelter API
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        408 => FailureKind::Retryable,
        400..=499 => FailureKind::Terminal,
        _ => FailureKind::Retryable,
    }
}

/// Classify a transport-level error message
pub fn classify_error(error: &str) -> FailureKind {
    let lower = error.to_lowercase();

    if lower.contains("rate limit") || lower.contains("too many requests") {
        return FailureKind::RateLimited;
    }

    // Request could never be built or accepted as sent
    if lower.contains("builder error")
        || lower.contains("invalid url")
        || lower.contains("relative url")
        || lower.contains("unsupported")
    {
        return FailureKind::Terminal;
    }

    // Connection problems, timeouts and anything unknown are worth retrying
    FailureKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let capped_delay = config
        .base_delay_ms
        .saturating_mul(multiplier)
        .min(config.max_delay_ms);

    let final_delay = if config.jitter {
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        ((capped_delay as f64 * jitter_factor) as u64).min(config.max_delay_ms)
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Delay before retrying a failure of the given kind
pub fn delay_for(kind: FailureKind, attempt: u32, config: &RetryConfig) -> Duration {
    match kind {
        FailureKind::RateLimited => Duration::from_millis(config.max_delay_ms),
        _ => calculate_delay(attempt, config),
    }
}
