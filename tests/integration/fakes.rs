//! In-memory fakes for integration testing.
//!
//! Deterministic stand-ins for the macro API, the market store and the
//! webhook endpoint. Failures and responses are controllable from test
//! code and every call is counted or recorded.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use appraiser::data::{MacroSource, MarketStore};
use appraiser::emitter::transport::TransportError;
use appraiser::emitter::{OutboundRequest, TransportResponse, WebhookTransport};
use appraiser::types::*;

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn fundamentals(as_of: NaiveDate) -> MarketFundamentals {
    MarketFundamentals {
        market_id: "dfw".into(),
        vacancy_rate: 0.12,
        asking_rent_psf: 32.0,
        rent_growth_yoy: 0.03,
        cap_rate_avg: 6.1,
        as_of_date: as_of,
        vacancy_rate_prior: Some(0.13),
        net_absorption_sf: Some(400_000.0),
        deliveries_sf: Some(500_000.0),
    }
}

pub fn macro_snapshot(as_of: NaiveDate) -> MacroSnapshot {
    MacroSnapshot {
        fed_funds_rate: 4.33,
        treasury_10y: 4.40,
        as_of_date: as_of,
        source: "fred".into(),
        fed_funds_prior: Some(5.33),
        treasury_10y_prior: Some(4.20),
    }
}

/// `n` verified sales at `cap_rate` and $250/sf, one every 10 days
/// starting `first_age_days` before today.
pub fn comps(n: usize, cap_rate: f64, first_age_days: i64) -> Vec<ComparableSale> {
    (0..n)
        .map(|i| ComparableSale {
            id: format!("sale-{i:03}"),
            market_id: "dfw".into(),
            submarket: "uptown".into(),
            sale_date: today() - Duration::days(first_age_days + i as i64 * 10),
            building_sf: 100_000.0,
            price_per_sf: 250.0,
            cap_rate_pct: cap_rate,
            year_built: Some(2005),
            verification_status: VerificationStatus::Verified,
            location: None,
        })
        .collect()
}

pub fn request() -> ValuationRequest {
    ValuationRequest {
        market_id: "dfw".into(),
        building_sf: 100_000.0,
        noi_annual: Some(1_500_000.0),
        year_built: Some(2005),
        submarket: Some("uptown".into()),
        rent_psf: None,
        opex_psf: None,
        latitude: None,
        longitude: None,
        valuation_date: None,
        acknowledge_stale_data: false,
    }
}

// ---------------------------------------------------------------------------
// Macro source
// ---------------------------------------------------------------------------

pub struct FakeMacro {
    snapshot: MacroSnapshot,
    failing: Arc<Mutex<bool>>,
    calls: AtomicUsize,
}

impl FakeMacro {
    pub fn new(snapshot: MacroSnapshot) -> Self {
        Self {
            snapshot,
            failing: Arc::new(Mutex::new(false)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MacroSource for FakeMacro {
    fn name(&self) -> &'static str {
        "fake_fred"
    }

    async fn latest(&self) -> Result<MacroSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("503 Service Unavailable"));
        }
        Ok(self.snapshot.clone())
    }
}

// ---------------------------------------------------------------------------
// Market store
// ---------------------------------------------------------------------------

pub struct FakeStore {
    fundamentals: Option<MarketFundamentals>,
    comps: Vec<ComparableSale>,
    failing: Arc<Mutex<bool>>,
}

impl FakeStore {
    pub fn new(fundamentals: Option<MarketFundamentals>, comps: Vec<ComparableSale>) -> Self {
        Self {
            fundamentals,
            comps,
            failing: Arc::new(Mutex::new(false)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl MarketStore for FakeStore {
    fn name(&self) -> &'static str {
        "fake_store"
    }

    async fn fundamentals(&self, market_id: &str) -> Result<Option<MarketFundamentals>> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .fundamentals
            .clone()
            .filter(|f| f.market_id == market_id))
    }

    async fn comps(&self, market_id: &str, limit: u32) -> Result<Vec<ComparableSale>> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .comps
            .iter()
            .filter(|c| c.market_id == market_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Webhook endpoint
// ---------------------------------------------------------------------------

/// Replies from a script (last reply repeats) and records every request.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Result<TransportResponse, TransportError>,
    requests: Mutex<Vec<OutboundRequest>>,
    latency: Option<std::time::Duration>,
}

impl ScriptedTransport {
    pub fn always(status: u16) -> Self {
        Self::scripted(vec![], status)
    }

    pub fn scripted(statuses: Vec<u16>, then: u16) -> Self {
        Self {
            script: Mutex::new(statuses.into_iter().map(reply).collect()),
            fallback: reply(then),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Hold every reply for `latency` before answering.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn reply(status: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        retry_after: None,
    })
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

use appraiser::backtest::Calibration;
use appraiser::emitter::{Emitter, EmitterConfig, RetryPolicy};
use appraiser::engine::breaker::CircuitBreakerConfig;
use appraiser::engine::fetcher::{FetchSettings, ResilientFetcher};
use appraiser::engine::freshness::FreshnessPolicy;
use appraiser::engine::orchestrator::{Orchestrator, OrchestratorSettings};
use appraiser::valuation::{Estimator, EstimatorConfig};
use secrecy::Secret;

pub const SECRET: &str = "integration-test-secret";

pub fn emitter_config() -> EmitterConfig {
    EmitterConfig {
        url: "https://hooks.example.com/valuations".into(),
        secret: Secret::new(SECRET.to_string()),
        retry: RetryPolicy::default(),
        timeout: std::time::Duration::from_secs(20),
        breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: std::time::Duration::from_secs(120),
        },
        freshness: FreshnessPolicy::default(),
    }
}

/// A fully wired orchestrator over the fakes.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub macro_source: Arc<FakeMacro>,
    pub store: Arc<FakeStore>,
    pub transport: Arc<ScriptedTransport>,
}

impl Harness {
    pub fn new(store: FakeStore, transport: ScriptedTransport) -> Self {
        Self::with_settings(store, transport, FetchSettings::default())
    }

    pub fn with_settings(
        store: FakeStore,
        transport: ScriptedTransport,
        fetch: FetchSettings,
    ) -> Self {
        let macro_source = Arc::new(FakeMacro::new(macro_snapshot(today())));
        let store = Arc::new(store);
        let transport = Arc::new(transport);

        let fetcher = ResilientFetcher::new(macro_source.clone(), store.clone(), fetch);
        let emitter = Emitter::new(emitter_config(), transport.clone());
        let orchestrator = Orchestrator::new(
            Arc::new(fetcher),
            Arc::new(Estimator::new(EstimatorConfig::default(), Calibration::default())),
            Arc::new(emitter),
            OrchestratorSettings {
                tenant_id: "acme".into(),
                known_markets: vec!["dfw".into(), "atl".into()],
                request_budget: std::time::Duration::from_secs(60),
                delivery_budget: std::time::Duration::from_secs(120),
                concurrency: 10,
                emit_batch_size: 25,
                emit_pause: std::time::Duration::from_millis(250),
                max_properties: 500,
                results_path: None,
            },
        );

        Self {
            orchestrator,
            macro_source,
            store,
            transport,
        }
    }

    pub async fn value(&self, request: ValuationRequest) -> Result<ValuationResult, ValuationError> {
        let ctx = self.orchestrator.new_context();
        self.orchestrator.value_property(request, &ctx).await
    }
}
