//! Valuation pipeline: fetch, estimate, reconcile, emit.

use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use appraiser::backtest::Calibration;
use appraiser::engine::fetcher::FetchSettings;
use appraiser::types::*;
use appraiser::valuation::{Estimator, EstimatorConfig, STALE_REMEDIATION};

use crate::fakes::*;

fn event_json(transport: &ScriptedTransport, index: usize) -> serde_json::Value {
    let requests = transport.requests();
    serde_json::from_slice(&requests[index].body).unwrap()
}

fn fetched<T>(data: T, as_of: chrono::NaiveDate) -> Fetched<T> {
    Fetched {
        data,
        provenance: Provenance {
            source: "fixture".into(),
            as_of,
            from_cache: false,
        },
        freshness: Freshness::Fresh,
    }
}

#[tokio::test]
async fn test_clean_market_values_at_comp_cap_rate() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
    );

    let result = h.value(request()).await.unwrap();

    assert!((result.cap_rate_applied - 6.0).abs() < 1e-9);
    assert!((result.point - 25_000_000.0).abs() / 25_000_000.0 < 0.01);
    assert!(result.low < result.point && result.point < result.high);
    assert_eq!(result.comp_count, 12);
    assert!(result.fallback_reason.is_none());
    assert!(result.warnings.is_empty(), "unexpected warnings {:?}", result.warnings);
    assert!((0.0..=1.0).contains(&result.confidence));

    assert_eq!(h.transport.request_count(), 1);
    let event = event_json(&h.transport, 0);
    assert_eq!(event["type"], "valuation.upsert");
    assert_eq!(event["tenant_id"], "acme");
    assert_eq!(event["market_id"], "dfw");
    assert!(event.get("status").is_none());
}

#[tokio::test]
async fn test_thin_market_falls_back_to_trailing_median() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(5, 6.0, 5)),
        ScriptedTransport::always(200),
    );

    let result = h.value(request()).await.unwrap();

    assert_eq!(result.fallback_reason, Some(FallbackReason::LowSampleSize));
    assert!(result.has_warning("low_sample_size"));
    assert!((result.cap_rate_applied - 6.0).abs() < 1e-9);
    assert!(result.half_width_pct >= 0.10);
}

#[tokio::test]
async fn test_dispersed_comps_widen_interval() {
    let mut sales = comps(12, 6.0, 5);
    for (i, sale) in sales.iter_mut().enumerate() {
        sale.cap_rate_pct = if i % 2 == 0 { 4.5 } else { 7.5 };
    }
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), sales),
        ScriptedTransport::always(200),
    );

    let result = h.value(request()).await.unwrap();

    assert!(result.dispersion_bps > 150.0);
    assert!(result.has_warning("high_dispersion"));
    assert_eq!(result.fallback_reason, Some(FallbackReason::HighDispersion));
}

#[tokio::test]
async fn test_stale_comps_require_acknowledgement() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 600)),
        ScriptedTransport::always(200),
    );

    let err = h.value(request()).await.unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert_eq!(err.remediation(), Some(STALE_REMEDIATION));

    assert_eq!(h.transport.request_count(), 1);
    assert_eq!(event_json(&h.transport, 0)["type"], "valuation.insufficient");

    let mut acknowledged = request();
    acknowledged.acknowledge_stale_data = true;
    let result = h.value(acknowledged).await.unwrap();

    assert_eq!(result.fallback_reason, Some(FallbackReason::StaleData));
    assert!(result.has_warning("stale_data"));
    assert_eq!(event_json(&h.transport, 1)["status"], "STALE_DATA");
}

#[tokio::test]
async fn test_outage_serves_last_known_inputs() {
    let settings = FetchSettings {
        macro_ttl: Duration::ZERO,
        fundamentals_ttl: Duration::ZERO,
        comps_ttl: Duration::ZERO,
        ..FetchSettings::default()
    };
    let h = Harness::with_settings(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
        settings,
    );

    let first = h.value(request()).await.unwrap();
    assert!(!first.provenance.comps.from_cache);

    h.macro_source.set_failing(true);
    h.store.set_failing(true);
    let second = h.value(request()).await.unwrap();

    assert!(second.provenance.macro_data.from_cache);
    assert!(second.provenance.fundamentals.from_cache);
    assert!(second.provenance.comps.from_cache);
    assert!(second.has_warning("macro_stale"));
    assert!((second.point - first.point).abs() < 1e-6);
    assert_eq!(h.macro_source.calls(), 2);
}

#[tokio::test]
async fn test_outage_without_history_is_unavailable() {
    let store = FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5));
    store.set_failing(true);
    let h = Harness::new(store, ScriptedTransport::always(200));

    let err = h.value(request()).await.unwrap_err();

    assert_eq!(err.status_code(), 503);
    assert_eq!(err.kind(), "upstream_unavailable");
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_unknown_market_rejected_before_fetch() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
    );
    let mut bad = request();
    bad.market_id = "nowhere".into();

    let err = assert_err!(h.value(bad).await);

    assert_eq!(err.status_code(), 400);
    assert_eq!(h.macro_source.calls(), 0);
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_repeat_valuation_is_identical() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
    );

    let a = h.value(request()).await.unwrap();
    let b = h.value(request()).await.unwrap();

    assert_eq!(a.point, b.point);
    assert_eq!(a.low, b.low);
    assert_eq!(a.high, b.high);
    assert_eq!(a.cap_rate_applied, b.cap_rate_applied);
    assert_eq!(a.forecast.value, b.forecast.value);
    assert!(b.provenance.comps.from_cache);
}

#[test]
fn test_comp_order_does_not_change_estimate() {
    let date = today();
    let subject = request().validate(&["dfw".to_string()], date).unwrap();
    let estimator = Estimator::new(EstimatorConfig::default(), Calibration::default());

    let mut sales = comps(14, 6.0, 5);
    for (i, sale) in sales.iter_mut().enumerate() {
        sale.cap_rate_pct = 5.4 + (i as f64 * 7.0 % 11.0) * 0.1;
        sale.building_sf = 80_000.0 + i as f64 * 5_000.0;
    }
    let mut reversed = sales.clone();
    reversed.reverse();
    let mut rotated = sales.clone();
    rotated.rotate_left(5);

    let fund = fetched(fundamentals(date), date);
    let mac = fetched(macro_snapshot(date), date);
    let base = estimator
        .estimate(&subject, &fetched(sales, date), &fund, &mac)
        .unwrap();

    for permuted in [reversed, rotated] {
        let other = estimator
            .estimate(&subject, &fetched(permuted, date), &fund, &mac)
            .unwrap();
        assert!((other.cap_rate_applied - base.cap_rate_applied).abs() < 1e-9);
        assert!((other.point - base.point).abs() < 1e-6);
        assert!((other.dispersion_bps - base.dispersion_bps).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_portfolio_keeps_request_order() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
    );
    let mut unknown = request();
    unknown.market_id = "nowhere".into();
    let mut larger = request();
    larger.building_sf = 200_000.0;
    larger.noi_annual = Some(3_000_000.0);

    let ctx = h.orchestrator.new_context();
    let outcome = assert_ok!(
        h.orchestrator
            .value_portfolio(vec![request(), unknown, larger], &ctx)
            .await
    );

    assert_eq!(outcome.results.len(), 3);
    let first = outcome.results[0].as_ref().unwrap();
    assert_eq!(outcome.results[1].as_ref().unwrap_err().status_code(), 400);
    let third = outcome.results[2].as_ref().unwrap();
    assert!(third.point > first.point);
    assert_eq!(outcome.delivered, 2);
    assert_eq!(outcome.delivery_failures, 0);
}

#[tokio::test]
async fn test_empty_portfolio_rejected() {
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200),
    );
    let ctx = h.orchestrator.new_context();

    let err = h.orchestrator.value_portfolio(vec![], &ctx).await.unwrap_err();

    assert_eq!(err.status_code(), 400);
}

#[tokio::test(start_paused = true)]
async fn test_slow_webhook_still_reaches_late_portfolio_events() {
    // 6 deliveries at 15s each outlast the 60s request budget
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), comps(12, 6.0, 5)),
        ScriptedTransport::always(200).with_latency(Duration::from_secs(15)),
    );
    let requests: Vec<ValuationRequest> = (0..6)
        .map(|i| {
            let mut r = request();
            r.building_sf = 100_000.0 + 1_000.0 * i as f64;
            r
        })
        .collect();

    let ctx = h.orchestrator.new_context();
    let outcome = assert_ok!(h.orchestrator.value_portfolio(requests, &ctx).await);

    assert!(outcome.results.iter().all(|r| r.is_ok()));
    assert_eq!(outcome.delivered, 6);
    assert_eq!(outcome.delivery_failures, 0);
    assert_eq!(h.transport.request_count(), 6);
}

/// Recent sales at `recent_cap` plus an older cohort ~27 months back at
/// `old_cap`, so the market trend has enough span to fit.
fn sloped_market(recent_cap: f64, recent_age_days: i64, old_cap: f64, old_age_days: i64) -> Vec<ComparableSale> {
    let mut sales = comps(8, recent_cap, recent_age_days);
    for (i, mut old) in comps(8, old_cap, old_age_days).into_iter().enumerate() {
        old.id = format!("old-{i:03}");
        sales.push(old);
    }
    sales
}

#[tokio::test]
async fn test_sloped_market_moves_applied_cap_rate_with_trend() {
    // Cap rates rising over time: older sales sat lower
    let rising = Harness::new(
        FakeStore::new(Some(fundamentals(today())), sloped_market(6.0, 20, 5.0, 800)),
        ScriptedTransport::always(200),
    );
    let up = rising.value(request()).await.unwrap();
    assert!(up.cap_rate_applied > 6.0, "cap={}", up.cap_rate_applied);
    assert!(up.cap_rate_applied < 6.5, "cap={}", up.cap_rate_applied);

    // Cap rates falling over time: older sales sat higher
    let falling = Harness::new(
        FakeStore::new(Some(fundamentals(today())), sloped_market(6.0, 20, 7.0, 800)),
        ScriptedTransport::always(200),
    );
    let down = falling.value(request()).await.unwrap();
    assert!(down.cap_rate_applied < 6.0, "cap={}", down.cap_rate_applied);
    assert!(down.cap_rate_applied > 5.5, "cap={}", down.cap_rate_applied);

    assert!(down.point > up.point);
}

#[tokio::test]
async fn test_steep_falling_market_keeps_cap_rate_in_band() {
    // Roughly -0.45 pts/month: unbounded, the recent sales would adjust below zero
    let h = Harness::new(
        FakeStore::new(Some(fundamentals(today())), sloped_market(3.0, 250, 14.5, 1000)),
        ScriptedTransport::always(200),
    );

    let result = assert_ok!(h.value(request()).await);

    assert!(
        (2.0..=15.0).contains(&result.cap_rate_applied),
        "cap={}",
        result.cap_rate_applied
    );
    assert!(result.point > 0.0 && result.point.is_finite());
    assert!(result.low > 0.0 && result.low <= result.point && result.point <= result.high);

    assert_eq!(h.transport.request_count(), 1);
    let event = event_json(&h.transport, 0);
    assert_eq!(event["type"], "valuation.upsert");
}
