//! Webhook delivery: signing, retry schedule, idempotency key, breaker.

use std::sync::Arc;
use std::time::Duration;

use appraiser::backtest::Calibration;
use appraiser::emitter::signing;
use appraiser::emitter::{payload_hash, Emitter, ValuationEvent};
use appraiser::engine::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use appraiser::types::*;
use appraiser::valuation::{Estimator, EstimatorConfig};

use crate::fakes::*;

fn event(tenant: &str) -> ValuationEvent {
    let date = today();
    let subject = request().validate(&["dfw".to_string()], date).unwrap();
    let fetched = |as_of| Provenance {
        source: "fixture".into(),
        as_of,
        from_cache: false,
    };
    let fund = Fetched {
        data: fundamentals(date),
        provenance: fetched(date),
        freshness: Freshness::Fresh,
    };
    let mac = Fetched {
        data: macro_snapshot(date),
        provenance: fetched(date),
        freshness: Freshness::Fresh,
    };
    let sales = Fetched {
        data: comps(12, 6.0, 5),
        provenance: fetched(date - chrono::Duration::days(5)),
        freshness: Freshness::Fresh,
    };
    let result = Estimator::new(EstimatorConfig::default(), Calibration::default())
        .estimate(&subject, &sales, &fund, &mac)
        .unwrap();
    ValuationEvent::upsert(tenant, &subject, &result, &fund.data, &mac.data)
}

fn emitter(transport: Arc<ScriptedTransport>) -> Emitter {
    Emitter::new(emitter_config(), transport)
}

fn ctx(budget: Duration) -> RequestContext {
    RequestContext::new(budget)
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_retry_with_doubling_backoff() {
    let transport = Arc::new(ScriptedTransport::always(500));
    let emitter = emitter(transport.clone());

    let outcome = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;

    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 5);
    assert_eq!(
        outcome.delays,
        vec![
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]
    );
    assert!(matches!(
        outcome.error,
        Some(DeliveryError::Exhausted {
            attempts: 5,
            last_status: Some(500),
            ..
        })
    ));
    assert_eq!(transport.request_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::always(404));
    let emitter = emitter(transport.clone());

    let outcome = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.error, Some(DeliveryError::Rejected { status: 404 }));
    assert!(outcome.delays.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let transport = Arc::new(ScriptedTransport::scripted(vec![503, 500], 200));
    let emitter = emitter(transport.clone());

    let outcome = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;

    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.status_code, Some(200));

    let audit = emitter.audit().recent(10).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].attempts, 3);
    assert!(audit[0].delivered);
}

#[tokio::test(start_paused = true)]
async fn test_retries_resend_identical_signed_body() {
    let transport = Arc::new(ScriptedTransport::scripted(vec![500, 500], 200));
    let emitter = emitter(transport.clone());

    let outcome = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    let requests = transport.requests();

    assert_eq!(requests.len(), 3);
    let hash = outcome.payload_hash.unwrap();
    for req in &requests {
        assert_eq!(req.body, requests[0].body);
        assert_eq!(req.header("X-Payload-Hash"), Some(hash.as_str()));
        assert_eq!(req.header("X-Request-Id"), Some(outcome.request_id.to_string().as_str()));
        let signature = req.header("X-Signature").unwrap();
        assert!(signing::verify(SECRET.as_bytes(), &req.body, signature));
    }
    assert_eq!(payload_hash(&requests[0].body), hash);

    let mut tampered = requests[0].body.clone();
    tampered.push(b' ');
    let signature = requests[0].header("X-Signature").unwrap();
    assert!(!signing::verify(SECRET.as_bytes(), &tampered, signature));
}

#[tokio::test(start_paused = true)]
async fn test_payload_hash_tracks_content_only() {
    let transport = Arc::new(ScriptedTransport::always(200));
    let emitter = emitter(transport.clone());

    let first = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    let second = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    let other = emitter.emit(event("acmf"), &ctx(Duration::from_secs(60))).await;

    assert_ne!(first.request_id, second.request_id);
    assert_eq!(first.payload_hash, second.payload_hash);
    assert_ne!(first.payload_hash, other.payload_hash);
}

#[tokio::test(start_paused = true)]
async fn test_short_deadline_stops_retrying() {
    let transport = Arc::new(ScriptedTransport::always(500));
    let emitter = emitter(transport.clone());

    let outcome = emitter.emit(event("acme"), &ctx(Duration::from_secs(1))).await;

    assert_eq!(outcome.error, Some(DeliveryError::DeadlineExceeded { attempts: 2 }));
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_webhook_breaker_fails_fast_then_recovers() {
    let transport = Arc::new(ScriptedTransport::scripted(vec![500; 5], 200));
    let emitter = emitter(transport.clone());

    let exhausted = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    assert_eq!(exhausted.attempts, 5);
    assert_eq!(emitter.breaker_snapshot().await.state, CircuitState::Open);

    let blocked = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    assert_eq!(blocked.error, Some(DeliveryError::CircuitOpen));
    assert_eq!(blocked.attempts, 0);
    assert_eq!(transport.request_count(), 5);

    tokio::time::advance(Duration::from_secs(120)).await;

    let recovered = emitter.emit(event("acme"), &ctx(Duration::from_secs(60))).await;
    assert!(recovered.delivered);
    assert_eq!(emitter.breaker_snapshot().await.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_state_cycle() {
    let breaker = CircuitBreaker::new(
        "webhook",
        CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(120),
        },
    );

    for _ in 0..4 {
        assert!(breaker.allow().await);
        breaker.record_failure().await;
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);
    breaker.record_failure().await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.allow().await);

    tokio::time::advance(Duration::from_secs(119)).await;
    assert!(!breaker.allow().await);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(breaker.allow().await);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    assert!(!breaker.allow().await, "only one trial call");

    breaker.record_success().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.failure_count().await, 0);

    let snapshot = breaker.snapshot().await;
    assert_eq!(snapshot.trip_count, 1);
}
