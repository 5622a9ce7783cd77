//! Event emitter.
//!
//! Delivers valuation events to the configured webhook. One call walks a
//! fixed sequence of stages:
//!
//! `validate -> adjust for staleness -> hash -> circuit check -> send (with retry) -> audit`
//!
//! Delivery never fails the valuation that produced the event: `emit`
//! always returns an `EmitOutcome`, with the error inside it.

pub mod audit;
pub mod event;
pub mod retry;
pub mod signing;
pub mod transport;

use chrono::{NaiveDate, Utc};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::engine::freshness::FreshnessPolicy;
use crate::types::{DeliveryError, RequestContext, SourceKind};

pub use audit::{AuditEntry, AuditLog};
pub use event::{payload_hash, EventStatus, EventType, ValuationEvent};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{HttpTransport, OutboundRequest, TransportResponse, WebhookTransport};

/// Confidence removed from every block of a stale event.
pub const STALE_CONFIDENCE_PENALTY: f64 = 0.2;

pub const HEADER_REQUEST_ID: &str = "X-Request-Id";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_PAYLOAD_HASH: &str = "X-Payload-Hash";
pub const HEADER_SIGNATURE: &str = "X-Signature";

// ---------------------------------------------------------------------------
// Configuration and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub url: String,
    pub secret: Secret<String>,
    pub retry: RetryPolicy,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    pub breaker: CircuitBreakerConfig,
    pub freshness: FreshnessPolicy,
}

impl EmitterConfig {
    pub fn from_app(config: &AppConfig, secret: Secret<String>) -> Self {
        let hook = &config.webhook;
        Self {
            url: hook.url.clone(),
            secret,
            retry: RetryPolicy {
                max_attempts: hook.max_attempts,
                base_delay: Duration::from_millis(hook.base_backoff_ms),
                max_retry_after: Duration::from_secs(hook.max_retry_after_secs),
            },
            timeout: Duration::from_secs(hook.timeout_secs),
            breaker: config.webhook_breaker(),
            freshness: config.freshness_policy(),
        }
    }
}

/// Result of one `emit` call.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    pub delivered: bool,
    pub attempts: u32,
    pub request_id: Uuid,
    /// Absent when the event failed validation before hashing.
    pub payload_hash: Option<String>,
    pub status_code: Option<u16>,
    pub error: Option<DeliveryError>,
    /// Backoff slept before each retry, in order.
    pub delays: Vec<Duration>,
}

impl EmitOutcome {
    fn rejected(request_id: Uuid, error: DeliveryError) -> Self {
        Self {
            delivered: false,
            attempts: 0,
            request_id,
            payload_hash: None,
            status_code: None,
            error: Some(error),
            delays: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct EmitterStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub attempts: AtomicU64,
    pub stale_downgrades: AtomicU64,
}

// ---------------------------------------------------------------------------
// Staleness downgrade
// ---------------------------------------------------------------------------

/// Mark the event `STALE_DATA` and cut its confidences when any source it
/// consumed is past its freshness threshold on `today`. Returns whether
/// the event was changed. An event already marked stale is left alone.
pub fn adjust_for_staleness(
    event: &mut ValuationEvent,
    policy: &FreshnessPolicy,
    today: NaiveDate,
) -> bool {
    if event.status == Some(EventStatus::StaleData) {
        return false;
    }
    let p = &event.provenance;
    let sources = [
        (SourceKind::Macro, &p.macro_data),
        (SourceKind::Fundamentals, &p.fundamentals),
        (SourceKind::Comps, &p.comps),
    ];
    let stale = sources.iter().any(|(kind, prov)| {
        prov.as_ref()
            .map(|prov| !policy.classify(*kind, prov.as_of, today).is_fresh())
            .unwrap_or(false)
    });
    if !stale {
        return false;
    }

    event.status = Some(EventStatus::StaleData);
    if let Some(cv) = event.current_value.as_mut() {
        cv.confidence = (cv.confidence - STALE_CONFIDENCE_PENALTY).max(0.0);
    }
    if let Some(fc) = event.forecast_12m.as_mut() {
        fc.confidence = (fc.confidence - STALE_CONFIDENCE_PENALTY).max(0.0);
    }
    true
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

pub struct Emitter {
    config: EmitterConfig,
    transport: Arc<dyn WebhookTransport>,
    breaker: CircuitBreaker,
    audit: AuditLog,
    stats: EmitterStats,
}

impl Emitter {
    pub fn new(config: EmitterConfig, transport: Arc<dyn WebhookTransport>) -> Self {
        let breaker = CircuitBreaker::new("webhook", config.breaker);
        Self {
            config,
            transport,
            breaker,
            audit: AuditLog::default(),
            stats: EmitterStats::default(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn stats(&self) -> &EmitterStats {
        &self.stats
    }

    pub async fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot().await
    }

    /// Deliver one event. Never returns an error; see `EmitOutcome`.
    pub async fn emit(&self, mut event: ValuationEvent, ctx: &RequestContext) -> EmitOutcome {
        let request_id = ctx.request_id;

        // VALIDATE
        if let Err(problems) = event.validate() {
            warn!(%request_id, problems = ?problems, "Event failed validation, not sent");
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return EmitOutcome::rejected(request_id, DeliveryError::Validation(problems));
        }

        // ADJUST_FOR_STALENESS
        let today = Utc::now().date_naive();
        if adjust_for_staleness(&mut event, &self.config.freshness, today) {
            self.stats.stale_downgrades.fetch_add(1, Ordering::Relaxed);
            info!(%request_id, market = %event.market_id, "Event downgraded to STALE_DATA");
        }

        // HASH
        let body = match event.canonical_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(%request_id, error = %e, "Event encoding failed");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return EmitOutcome::rejected(
                    request_id,
                    DeliveryError::Validation(vec![format!("encoding failed: {e}")]),
                );
            }
        };
        let hash = payload_hash(&body);

        let started = Instant::now();
        let mut outcome = self.deliver(body, &hash, ctx).await;
        outcome.payload_hash = Some(hash);

        // AUDIT
        self.audit
            .record(AuditEntry {
                timestamp: Utc::now(),
                request_id,
                payload_hash: outcome.payload_hash.clone().unwrap_or_default(),
                status_code: outcome.status_code,
                attempts: outcome.attempts,
                duration_ms: started.elapsed().as_millis() as u64,
                delivered: outcome.delivered,
                error: outcome.error.as_ref().map(|e| e.to_string()),
            })
            .await;

        if outcome.delivered {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            info!(
                %request_id,
                attempts = outcome.attempts,
                status = ?outcome.status_code,
                "Event delivered"
            );
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                %request_id,
                attempts = outcome.attempts,
                status = ?outcome.status_code,
                error = ?outcome.error,
                "Event delivery failed"
            );
        }
        outcome
    }

    /// CIRCUIT_CHECK and SEND. Iterative: the attempt counter and computed
    /// delay are the whole retry state.
    async fn deliver(&self, body: Vec<u8>, hash: &str, ctx: &RequestContext) -> EmitOutcome {
        let request_id = ctx.request_id;
        let mut outcome = EmitOutcome {
            delivered: false,
            attempts: 0,
            request_id,
            payload_hash: None,
            status_code: None,
            error: None,
            delays: Vec::new(),
        };

        let signature = match signing::sign(self.config.secret.expose_secret().as_bytes(), &body) {
            Ok(sig) => sig,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.allow().await {
                outcome.error = Some(DeliveryError::CircuitOpen);
                return outcome;
            }
            if ctx.is_expired() {
                outcome.error = Some(DeliveryError::DeadlineExceeded { attempts: attempt });
                return outcome;
            }

            attempt += 1;
            outcome.attempts = attempt;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let request = OutboundRequest {
                url: self.config.url.clone(),
                headers: vec![
                    ("Content-Type".to_string(), "application/json".to_string()),
                    (HEADER_REQUEST_ID.to_string(), request_id.to_string()),
                    (HEADER_TIMESTAMP.to_string(), Utc::now().to_rfc3339()),
                    (HEADER_PAYLOAD_HASH.to_string(), hash.to_string()),
                    (HEADER_SIGNATURE.to_string(), signature.clone()),
                ],
                body: body.clone(),
                timeout: ctx.bound(self.config.timeout),
            };

            let result = self.transport.send(request).await;
            let last_error = match &result {
                Ok(resp) => {
                    outcome.status_code = Some(resp.status);
                    // 429 is throttling, not an outage: leave the breaker as is
                    if resp.status >= 500 {
                        self.breaker.record_failure().await;
                    } else if resp.status != 429 {
                        self.breaker.record_success().await;
                    }
                    format!("HTTP {}", resp.status)
                }
                Err(e) => {
                    self.breaker.record_failure().await;
                    e.to_string()
                }
            };
            debug!(%request_id, attempt, result = %last_error, "Delivery attempt");

            match self.config.retry.decide(attempt, &result) {
                RetryDecision::Delivered => {
                    outcome.delivered = true;
                    return outcome;
                }
                RetryDecision::Terminal => {
                    outcome.error = Some(match &result {
                        Ok(resp) if resp.status < 500 && resp.status != 429 => {
                            DeliveryError::Rejected { status: resp.status }
                        }
                        _ => DeliveryError::Exhausted {
                            attempts: attempt,
                            last_status: outcome.status_code,
                            last_error,
                        },
                    });
                    return outcome;
                }
                RetryDecision::Retry(delay) => {
                    if delay >= ctx.remaining() {
                        outcome.error = Some(DeliveryError::DeadlineExceeded { attempts: attempt });
                        return outcome;
                    }
                    outcome.delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
