//! Resilient fetch layer.
//!
//! Wraps the upstream adapters with a per-source TTL cache, a circuit
//! breaker per dependency (the macro API and the market store) and a
//! request-bounded timeout. Every value returned carries provenance and a
//! freshness grade.
//!
//! Lookup order for one source:
//! 1. fresh cache hit, served with `from_cache = true`
//! 2. breaker open: last known value (at least STALE), else `CircuitOpen`
//! 3. upstream call under the timeout; success writes through to the cache
//! 4. upstream failure: last known value (at least STALE), else
//!    `UpstreamUnavailable`

use chrono::{NaiveDate, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use super::cache::TtlCache;
use super::freshness::FreshnessPolicy;
use crate::data::{MacroSource, MarketStore};
use crate::types::{
    ComparableSale, Fetched, Freshness, MacroSnapshot, MarketFundamentals, Provenance,
    RequestContext, SourceKind, ValuationError,
};

/// Tunables for the fetch layer.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub macro_ttl: Duration,
    pub fundamentals_ttl: Duration,
    pub comps_ttl: Duration,
    pub macro_timeout: Duration,
    pub store_timeout: Duration,
    pub comps_limit: u32,
    pub macro_breaker: CircuitBreakerConfig,
    pub store_breaker: CircuitBreakerConfig,
    pub freshness: FreshnessPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            macro_ttl: Duration::from_secs(30 * 60),
            fundamentals_ttl: Duration::from_secs(24 * 60 * 60),
            comps_ttl: Duration::from_secs(6 * 60 * 60),
            macro_timeout: Duration::from_secs(15),
            store_timeout: Duration::from_secs(10),
            comps_limit: 200,
            macro_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            store_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(120),
            },
            freshness: FreshnessPolicy::default(),
        }
    }
}

/// Counters for the operations endpoint and shutdown summary.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub cache_hits: AtomicU64,
    pub upstream_calls: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub stale_served: AtomicU64,
}

impl FetchStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let calls = self.upstream_calls.load(Ordering::Relaxed);
        let total = hits + calls;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Date a fetched record describes, used for provenance and freshness.
trait Dated {
    fn as_of(&self) -> Option<NaiveDate>;

    /// Whether the value may be written to the cache.
    fn cacheable(&self) -> bool {
        true
    }
}

impl Dated for MacroSnapshot {
    fn as_of(&self) -> Option<NaiveDate> {
        Some(self.as_of_date)
    }
}

/// "Not found" carries no date and is never cached.
impl Dated for Option<MarketFundamentals> {
    fn as_of(&self) -> Option<NaiveDate> {
        self.as_ref().map(|f| f.as_of_date)
    }

    fn cacheable(&self) -> bool {
        self.is_some()
    }
}

/// A sale set is as recent as its newest sale.
impl Dated for Vec<ComparableSale> {
    fn as_of(&self) -> Option<NaiveDate> {
        self.iter().map(|c| c.sale_date).max()
    }
}

/// Per-source plumbing for one lookup.
struct Lane<'a, T> {
    kind: SourceKind,
    key: String,
    source_name: &'static str,
    cache: &'a TtlCache<T>,
    breaker: &'a CircuitBreaker,
    timeout: Duration,
}

pub struct ResilientFetcher {
    macro_source: Arc<dyn MacroSource>,
    store: Arc<dyn MarketStore>,
    macro_breaker: CircuitBreaker,
    store_breaker: CircuitBreaker,
    macro_cache: TtlCache<MacroSnapshot>,
    fundamentals_cache: TtlCache<Option<MarketFundamentals>>,
    comps_cache: TtlCache<Vec<ComparableSale>>,
    settings: FetchSettings,
    stats: FetchStats,
}

impl ResilientFetcher {
    pub fn new(
        macro_source: Arc<dyn MacroSource>,
        store: Arc<dyn MarketStore>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            macro_breaker: CircuitBreaker::new("macro", settings.macro_breaker),
            store_breaker: CircuitBreaker::new("market_store", settings.store_breaker),
            macro_cache: TtlCache::new(settings.macro_ttl),
            fundamentals_cache: TtlCache::new(settings.fundamentals_ttl),
            comps_cache: TtlCache::new(settings.comps_ttl),
            macro_source,
            store,
            settings,
            stats: FetchStats::default(),
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    pub async fn get_macro(
        &self,
        ctx: &RequestContext,
    ) -> Result<Fetched<MacroSnapshot>, ValuationError> {
        let lane = Lane {
            kind: SourceKind::Macro,
            key: "macro:latest".to_string(),
            source_name: self.macro_source.name(),
            cache: &self.macro_cache,
            breaker: &self.macro_breaker,
            timeout: self.settings.macro_timeout,
        };
        let source = self.macro_source.clone();
        self.fetch_through(lane, ctx, || async move { source.latest().await })
            .await
    }

    pub async fn get_fundamentals(
        &self,
        market_id: &str,
        ctx: &RequestContext,
    ) -> Result<Fetched<MarketFundamentals>, ValuationError> {
        let lane = Lane {
            kind: SourceKind::Fundamentals,
            key: format!("fundamentals:{market_id}"),
            source_name: self.store.name(),
            cache: &self.fundamentals_cache,
            breaker: &self.store_breaker,
            timeout: self.settings.store_timeout,
        };
        let store = self.store.clone();
        let market = market_id.to_string();
        let fetched = self
            .fetch_through(lane, ctx, || async move { store.fundamentals(&market).await })
            .await?;
        match fetched.data {
            Some(data) => Ok(Fetched {
                data,
                provenance: fetched.provenance,
                freshness: fetched.freshness,
            }),
            None => Err(ValuationError::insufficient(format!(
                "no market fundamentals on record for {market_id}"
            ))),
        }
    }

    pub async fn get_comps(
        &self,
        market_id: &str,
        limit: u32,
        ctx: &RequestContext,
    ) -> Result<Fetched<Vec<ComparableSale>>, ValuationError> {
        let lane = Lane {
            kind: SourceKind::Comps,
            key: format!("comps:{market_id}:{limit}"),
            source_name: self.store.name(),
            cache: &self.comps_cache,
            breaker: &self.store_breaker,
            timeout: self.settings.store_timeout,
        };
        let store = self.store.clone();
        let market = market_id.to_string();
        self.fetch_through(lane, ctx, || async move { store.comps(&market, limit).await })
            .await
    }

    /// Fetch all three inputs for a market concurrently.
    pub async fn get_all(
        &self,
        market_id: &str,
        ctx: &RequestContext,
    ) -> (
        Result<Fetched<MacroSnapshot>, ValuationError>,
        Result<Fetched<MarketFundamentals>, ValuationError>,
        Result<Fetched<Vec<ComparableSale>>, ValuationError>,
    ) {
        tokio::join!(
            self.get_macro(ctx),
            self.get_fundamentals(market_id, ctx),
            self.get_comps(market_id, self.settings.comps_limit, ctx),
        )
    }

    pub async fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.macro_breaker.snapshot().await,
            self.store_breaker.snapshot().await,
        ]
    }

    /// Drop cache entries older than `max_age` across all sources.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        self.macro_cache.evict_older_than(max_age).await
            + self.fundamentals_cache.evict_older_than(max_age).await
            + self.comps_cache.evict_older_than(max_age).await
    }

    // -- Core -------------------------------------------------------------

    async fn fetch_through<T, Fut, F>(
        &self,
        lane: Lane<'_, T>,
        ctx: &RequestContext,
        call: F,
    ) -> Result<Fetched<T>, ValuationError>
    where
        T: Clone + Dated,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let today = Utc::now().date_naive();

        if let Some(value) = lane.cache.get_fresh(&lane.key).await {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(source = %lane.kind, key = %lane.key, "Cache hit");
            return Ok(self.wrap(&lane, value, true, today));
        }

        if ctx.is_expired() {
            return self
                .stale_or(&lane, today, || ValuationError::UpstreamUnavailable {
                    source_kind: lane.kind,
                    message: "request deadline exceeded before fetch".to_string(),
                })
                .await;
        }

        if !lane.breaker.allow().await {
            debug!(source = %lane.kind, "Circuit open, skipping upstream");
            return self
                .stale_or(&lane, today, || ValuationError::CircuitOpen {
                    source_kind: lane.kind,
                })
                .await;
        }

        self.stats.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let timeout = ctx.bound(lane.timeout);
        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
        };

        match outcome {
            Ok(value) => {
                lane.breaker.record_success().await;
                if value.cacheable() {
                    lane.cache.insert(lane.key.clone(), value.clone()).await;
                }
                Ok(self.wrap(&lane, value, false, today))
            }
            Err(message) => {
                lane.breaker.record_failure().await;
                self.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(source = %lane.kind, key = %lane.key, error = %message, "Upstream fetch failed");
                self.stale_or(&lane, today, || ValuationError::UpstreamUnavailable {
                    source_kind: lane.kind,
                    message,
                })
                .await
            }
        }
    }

    /// Serve the last known value marked at least STALE, or build the error.
    async fn stale_or<T, E>(
        &self,
        lane: &Lane<'_, T>,
        today: NaiveDate,
        err: E,
    ) -> Result<Fetched<T>, ValuationError>
    where
        T: Clone + Dated,
        E: FnOnce() -> ValuationError,
    {
        match lane.cache.get_any(&lane.key).await {
            Some(value) => {
                self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                let mut fetched = self.wrap(lane, value, true, today);
                fetched.freshness = fetched.freshness.max(Freshness::Stale);
                info!(
                    source = %lane.kind,
                    as_of = %fetched.provenance.as_of,
                    freshness = %fetched.freshness,
                    "Serving last known value"
                );
                Ok(fetched)
            }
            None => Err(err()),
        }
    }

    fn wrap<T: Dated>(
        &self,
        lane: &Lane<'_, T>,
        value: T,
        from_cache: bool,
        today: NaiveDate,
    ) -> Fetched<T> {
        let (as_of, freshness) = match value.as_of() {
            Some(as_of) => (as_of, self.settings.freshness.classify(lane.kind, as_of, today)),
            None => (today, Freshness::Fresh),
        };
        Fetched {
            data: value,
            provenance: Provenance {
                source: lane.source_name.to_string(),
                as_of,
                from_cache,
            },
            freshness,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
