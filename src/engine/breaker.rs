//! Circuit breaker guarding an upstream dependency.
//!
//! Consecutive-failure breaker with three states:
//!
//! - `Closed`: calls pass through; each failure increments the counter.
//!   Reaching the threshold opens the circuit.
//! - `Open`: calls are rejected without touching the dependency until the
//!   cooldown elapses.
//! - `HalfOpen`: exactly one trial call is admitted. Success closes the
//!   circuit and zeroes the counter; failure re-opens it.
//!
//! All transitions happen under a single mutex so concurrent callers can
//! never admit two trial calls.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is admitted.
    pub cooldown: Duration,
}

/// Point-in-time view for the operations endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Seconds since the circuit last opened, while open or half-open.
    pub open_for_secs: Option<f64>,
    pub trip_count: u64,
    pub rejected_count: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    trip_count: u64,
    rejected_count: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_started: None,
                trip_count: 0,
                rejected_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission to call the dependency.
    ///
    /// Returns false when the call must fail fast. A half-open trial whose
    /// caller never reported back (e.g. the future was dropped) is
    /// considered abandoned after one cooldown and a new trial is admitted.
    pub async fn allow(&self) -> bool {
        let mut s = self.inner.lock().await;
        let now = Instant::now();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = s
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    s.state = CircuitState::HalfOpen;
                    s.trial_started = Some(now);
                    info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    true
                } else {
                    s.rejected_count += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                let trial_live = s
                    .trial_started
                    .map(|at| now.duration_since(at) < self.config.cooldown)
                    .unwrap_or(false);
                if trial_live {
                    s.rejected_count += 1;
                    false
                } else {
                    debug!(breaker = %self.name, "Previous trial abandoned, admitting another");
                    s.trial_started = Some(now);
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut s = self.inner.lock().await;
        if s.state != CircuitState::Closed {
            info!(breaker = %self.name, from = %s.state, "Circuit closed");
        }
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.opened_at = None;
        s.trial_started = None;
    }

    pub async fn record_failure(&self) {
        let mut s = self.inner.lock().await;
        s.failure_count = s.failure_count.saturating_add(1);
        match s.state {
            CircuitState::Closed if s.failure_count >= self.config.failure_threshold => {
                self.transition_to_open(&mut s);
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut s),
            _ => {}
        }
    }

    fn transition_to_open(&self, s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.trial_started = None;
        s.trip_count += 1;
        warn!(
            breaker = %self.name,
            failures = s.failure_count,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit opened"
        );
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let s = self.inner.lock().await;
        BreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            failure_threshold: self.config.failure_threshold,
            cooldown_secs: self.config.cooldown.as_secs(),
            open_for_secs: s.opened_at.map(|at| at.elapsed().as_secs_f64()),
            trip_count: s.trip_count,
            rejected_count: s.rejected_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
        )
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let cb = breaker(3, 60);
        for _ in 0..2 {
            assert!(cb.allow().await);
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.allow().await);
        assert_eq!(cb.snapshot().await.rejected_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let cb = breaker(3, 60);
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        assert_eq!(cb.failure_count().await, 0);
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(5, 120);
        for _ in 0..5 {
            cb.record_failure().await;
        }
        assert!(!cb.allow().await);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(!cb.allow().await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow().await, "trial admitted once cooldown elapses");
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(!cb.allow().await, "second caller fails fast during trial");

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
        assert!(cb.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 10);
        cb.record_failure().await;
        cb.record_failure().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.allow().await, "cooldown restarts on re-open");
        assert_eq!(cb.snapshot().await.trip_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_one_trial() {
        let cb = Arc::new(breaker(1, 5));
        cb.record_failure().await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move { cb.allow().await }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_replaced() {
        let cb = breaker(1, 30);
        cb.record_failure().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow().await);
        // Trial caller never reports back
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow().await);
    }
}
