//! Delivery retry policy.
//!
//! Pure decision function over one attempt's outcome; the send loop in
//! the emitter owns the attempt counter and the sleeping.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::transport::{TransportError, TransportResponse};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on a server-supplied `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Delivered,
    Retry(Duration),
    /// Stop without retrying (non-retryable response).
    Terminal,
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1`: base · 2^(attempt−1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Decide after attempt number `attempt` (1-based). Exhaustion is
    /// reported as `Terminal` once `max_attempts` is reached.
    pub fn decide(
        &self,
        attempt: u32,
        outcome: &Result<TransportResponse, TransportError>,
    ) -> RetryDecision {
        let retryable_delay = match outcome {
            Ok(resp) if (200..300).contains(&resp.status) => return RetryDecision::Delivered,
            Ok(resp) if resp.status == 429 => resp
                .retry_after
                .as_deref()
                .and_then(|v| parse_retry_after(v, Utc::now()))
                .map(|d| d.min(self.max_retry_after))
                .unwrap_or_else(|| self.backoff(attempt)),
            Ok(resp) if resp.status >= 500 => self.backoff(attempt),
            Ok(_) => return RetryDecision::Terminal,
            Err(_) => self.backoff(attempt),
        };

        if attempt >= self.max_attempts {
            RetryDecision::Terminal
        } else {
            RetryDecision::Retry(retryable_delay)
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
