//! Request orchestrator.
//!
//! Sequences one valuation: validate the request, fetch the three inputs
//! concurrently, run the estimator, persist the result and hand the event
//! to the emitter. Delivery outcome never changes the valuation returned.
//!
//! Portfolios fan out through a bounded worker pool and results come back
//! in request order. Their events are sent afterwards in batches with a
//! pause between batches.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::fetcher::ResilientFetcher;
use crate::config::AppConfig;
use crate::emitter::event::EventProvenance;
use crate::emitter::{Emitter, ValuationEvent};
use crate::storage;
use crate::types::{
    Fetched, MacroSnapshot, MarketFundamentals, RequestContext, SubjectProperty,
    ValuationError, ValuationRequest, ValuationResult,
};
use crate::valuation::Estimator;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tenant_id: String,
    pub known_markets: Vec<String>,
    pub request_budget: Duration,
    /// Budget for delivering one event, retries included.
    pub delivery_budget: Duration,
    pub concurrency: usize,
    pub emit_batch_size: usize,
    pub emit_pause: Duration,
    pub max_properties: usize,
    pub results_path: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            tenant_id: config.service.tenant_id.clone(),
            known_markets: config.service.known_markets.clone(),
            request_budget: Duration::from_secs(config.service.request_budget_secs),
            delivery_budget: Duration::from_secs(config.webhook.delivery_budget_secs),
            concurrency: config.portfolio.concurrency,
            emit_batch_size: config.portfolio.emit_batch_size,
            emit_pause: Duration::from_millis(config.portfolio.emit_pause_ms),
            max_properties: config.portfolio.max_properties,
            results_path: config.service.results_path.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub valuations: AtomicU64,
    pub insufficient: AtomicU64,
    pub failures: AtomicU64,
    pub events_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub valuations: u64,
    pub insufficient: u64,
    pub failures: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
}

/// Portfolio run result. `results` is in request order.
#[derive(Debug)]
pub struct PortfolioOutcome {
    pub results: Vec<Result<ValuationResult, ValuationError>>,
    pub delivered: usize,
    pub delivery_failures: usize,
}

/// One computed valuation and the event it produced, before delivery.
struct Computed {
    outcome: Result<ValuationResult, ValuationError>,
    event: Option<(ValuationEvent, RequestContext)>,
}

pub struct Orchestrator {
    fetcher: Arc<ResilientFetcher>,
    estimator: Arc<Estimator>,
    emitter: Arc<Emitter>,
    settings: OrchestratorSettings,
    stats: OrchestratorStats,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<ResilientFetcher>,
        estimator: Arc<Estimator>,
        emitter: Arc<Emitter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            fetcher,
            estimator,
            emitter,
            settings,
            stats: OrchestratorStats::default(),
        }
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn new_context(&self) -> RequestContext {
        RequestContext::new(self.settings.request_budget)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            valuations: self.stats.valuations.load(Ordering::Relaxed),
            insufficient: self.stats.insufficient.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
        }
    }

    /// Value one property and deliver its event.
    pub async fn value_property(
        &self,
        request: ValuationRequest,
        ctx: &RequestContext,
    ) -> Result<ValuationResult, ValuationError> {
        let computed = self.compute(request, ctx).await;
        if let Some((event, event_ctx)) = computed.event {
            self.deliver(event, &event_ctx).await;
        }
        computed.outcome
    }

    /// Value a batch of properties through the worker pool.
    pub async fn value_portfolio(
        &self,
        requests: Vec<ValuationRequest>,
        ctx: &RequestContext,
    ) -> Result<PortfolioOutcome, ValuationError> {
        if requests.is_empty() {
            return Err(ValuationError::Validation {
                reasons: vec!["portfolio must contain at least one property".to_string()],
            });
        }
        if requests.len() > self.settings.max_properties {
            return Err(ValuationError::Validation {
                reasons: vec![format!(
                    "portfolio of {} properties exceeds the limit of {}",
                    requests.len(),
                    self.settings.max_properties
                )],
            });
        }

        let total = requests.len();
        let computed: Vec<Computed> = stream::iter(requests)
            .map(|request| {
                let item_ctx = ctx.child();
                async move { self.compute(request, &item_ctx).await }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::with_capacity(total);
        let mut events = Vec::new();
        for c in computed {
            results.push(c.outcome);
            if let Some(ev) = c.event {
                events.push(ev);
            }
        }

        let mut delivered = 0;
        let mut delivery_failures = 0;
        let batch_size = self.settings.emit_batch_size.max(1);
        let batches = events.len().div_ceil(batch_size);
        for (i, batch) in events.chunks(batch_size).enumerate() {
            for (event, event_ctx) in batch {
                if self.deliver(event.clone(), event_ctx).await {
                    delivered += 1;
                } else {
                    delivery_failures += 1;
                }
            }
            if i + 1 < batches {
                tokio::time::sleep(self.settings.emit_pause).await;
            }
        }

        let ok = results.iter().filter(|r| r.is_ok()).count();
        info!(
            properties = total,
            valued = ok,
            failed = total - ok,
            delivered,
            delivery_failures,
            "Portfolio complete"
        );

        Ok(PortfolioOutcome {
            results,
            delivered,
            delivery_failures,
        })
    }

    // -- Internals --------------------------------------------------------

    async fn compute(&self, request: ValuationRequest, ctx: &RequestContext) -> Computed {
        let today = Utc::now().date_naive();
        let subject = match request.validate(&self.settings.known_markets, today) {
            Ok(s) => s,
            Err(e) => return self.failed(e, None),
        };

        let (macro_r, fund_r, comps_r) = self.fetcher.get_all(&subject.market_id, ctx).await;

        let (macro_snapshot, fundamentals, comps) = match (macro_r, fund_r, comps_r) {
            (Ok(m), Ok(f), Ok(c)) => (m, f, c),
            (m, f, c) => {
                let provenance = EventProvenance {
                    macro_data: m.as_ref().ok().map(|v| v.provenance.clone()),
                    fundamentals: f.as_ref().ok().map(|v| v.provenance.clone()),
                    comps: c.as_ref().ok().map(|v| v.provenance.clone()),
                };
                let macro_data = m.as_ref().ok().map(|v| v.data.clone());
                let errors: Vec<ValuationError> =
                    [m.err(), f.err(), c.err()].into_iter().flatten().collect();
                let err = pick_error(errors);
                let event = matches!(err, ValuationError::InsufficientData { .. }).then(|| {
                    ValuationEvent::insufficient(
                        &self.settings.tenant_id,
                        &subject,
                        provenance,
                        None,
                        macro_data.as_ref(),
                        err.reasons(),
                    )
                });
                return self.failed(err, event.map(|e| (e, ctx.clone())));
            }
        };

        match self
            .estimator
            .estimate(&subject, &comps, &fundamentals, &macro_snapshot)
        {
            Ok(result) => {
                self.stats.valuations.fetch_add(1, Ordering::Relaxed);
                if let Some(path) = &self.settings.results_path {
                    if let Err(e) = storage::append_result(&result, path).await {
                        warn!(error = %e, "Failed to persist valuation result");
                    }
                }
                let event = ValuationEvent::upsert(
                    &self.settings.tenant_id,
                    &subject,
                    &result,
                    &fundamentals.data,
                    &macro_snapshot.data,
                );
                Computed {
                    outcome: Ok(result),
                    event: Some((event, ctx.clone())),
                }
            }
            Err(err) => {
                let event = matches!(err, ValuationError::InsufficientData { .. })
                    .then(|| insufficient_event(
                        &self.settings.tenant_id,
                        &subject,
                        &macro_snapshot,
                        &fundamentals,
                        &comps.provenance,
                        err.reasons(),
                    ));
                self.failed(err, event.map(|e| (e, ctx.clone())))
            }
        }
    }

    fn failed(
        &self,
        err: ValuationError,
        event: Option<(ValuationEvent, RequestContext)>,
    ) -> Computed {
        match &err {
            ValuationError::InsufficientData { .. } => {
                self.stats.insufficient.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        info!(kind = err.kind(), error = %err, "Valuation not produced");
        Computed {
            outcome: Err(err),
            event,
        }
    }

    /// Emit and count. Returns whether the event was delivered.
    ///
    /// Delivery runs under its own deadline so a long valuation or a slow
    /// earlier batch cannot starve it.
    async fn deliver(&self, event: ValuationEvent, ctx: &RequestContext) -> bool {
        let delivery_ctx = ctx.with_budget(self.settings.delivery_budget);
        let outcome = self.emitter.emit(event, &delivery_ctx).await;
        if outcome.delivered {
            self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome.delivered
    }
}

/// Upstream failures outrank missing data; otherwise the first error wins.
fn pick_error(errors: Vec<ValuationError>) -> ValuationError {
    let mut errors = errors.into_iter();
    let mut chosen = match errors.next() {
        Some(e) => e,
        None => return ValuationError::insufficient("no inputs available"),
    };
    for e in errors {
        if matches!(chosen, ValuationError::InsufficientData { .. }) && e.status_code() == 503 {
            chosen = e;
        }
    }
    chosen
}

fn insufficient_event(
    tenant_id: &str,
    subject: &SubjectProperty,
    macro_snapshot: &Fetched<MacroSnapshot>,
    fundamentals: &Fetched<MarketFundamentals>,
    comps_provenance: &crate::types::Provenance,
    reasons: Vec<String>,
) -> ValuationEvent {
    let provenance = EventProvenance {
        macro_data: Some(macro_snapshot.provenance.clone()),
        fundamentals: Some(fundamentals.provenance.clone()),
        comps: Some(comps_provenance.clone()),
    };
    ValuationEvent::insufficient(
        tenant_id,
        subject,
        provenance,
        Some(&fundamentals.data),
        Some(&macro_snapshot.data),
        reasons,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
