//! Valuation estimator.
//!
//! Turns a validated subject plus the three fetched inputs into a
//! `ValuationResult`:
//!
//! 1. NOI (supplied or derived)
//! 2. comp screening, weighting and market-trend time adjustment
//! 3. trimmed weighted-median cap rate and its dispersion
//! 4. degradation rules (low sample, stale comps, high dispersion)
//! 5. direct capitalization, dual-engine reconciliation, forecast
//! 6. calibrated interval and confidence score
//!
//! The estimator is pure: the same inputs always give the same result.

pub mod aggregate;
pub mod confidence;
pub mod filter;
pub mod income;
pub mod reconcile;
pub mod trend;
pub mod weighting;

use tracing::debug;

use self::aggregate::{canonical_sort, weighted_iqr_bps, weighted_median, trim_tails, WeightedPoint};
use self::confidence::{confidence_score, ConfidenceInputs};
use self::filter::{filter_comps, trailing_market_median};
use self::income::{capitalize, derive_noi, forecast, ForecastCoefficients};
use self::reconcile::reconcile;
use self::trend::{fit_market_trend, time_adjust};
use self::weighting::weigh_comps;
use crate::backtest::Calibration;
use crate::types::{
    ComparableSale, FallbackReason, Fetched, MacroSnapshot, MarketFundamentals, ProvenanceBlock,
    SourceKind, SubjectProperty, ValuationError, ValuationResult, METHOD_VERSION,
};

/// Remediation offered when only stale comps are available.
pub const STALE_REMEDIATION: &str = "resubmit with acknowledge_stale_data=true";

pub const WARN_NO_COMPARABLES: &str = "no_comparables";

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Fewer valid comps than this triggers the low-sample fallback.
    pub min_comps: usize,
    /// Floor on the half-width under the low-sample fallback.
    pub low_sample_half_width: f64,
    pub dispersion_threshold_bps: f64,
    /// Added to the half-width under high dispersion, in bps of value.
    pub dispersion_widen_bps: f64,
    /// Added to the half-width when only stale comps are used.
    pub stale_widen_bps: f64,
    pub trim_fraction: f64,
    pub forecast: ForecastCoefficients,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_comps: 8,
            low_sample_half_width: 0.10,
            dispersion_threshold_bps: 150.0,
            dispersion_widen_bps: 250.0,
            stale_widen_bps: 450.0,
            trim_fraction: aggregate::TRIM_FRACTION,
            forecast: ForecastCoefficients::default(),
        }
    }
}

pub struct Estimator {
    config: EstimatorConfig,
    calibration: Calibration,
}

impl Estimator {
    pub fn new(config: EstimatorConfig, calibration: Calibration) -> Self {
        Self { config, calibration }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn estimate(
        &self,
        subject: &SubjectProperty,
        comps: &Fetched<Vec<ComparableSale>>,
        fundamentals: &Fetched<MarketFundamentals>,
        macro_snapshot: &Fetched<MacroSnapshot>,
    ) -> Result<ValuationResult, ValuationError> {
        let date = subject.valuation_date;
        let noi = derive_noi(subject, &fundamentals.data)?;

        // -- Screening -----------------------------------------------------
        let screened = filter_comps(&comps.data, date);
        let mut fallbacks: Vec<FallbackReason> = Vec::new();

        let working: &[ComparableSale] = if screened.primary.is_empty() && !screened.stale.is_empty() {
            if !subject.acknowledge_stale_data {
                return Err(ValuationError::InsufficientData {
                    reasons: vec![format!(
                        "all {} valid comparable sales are older than {} months",
                        screened.stale.len(),
                        filter::MAX_PRIMARY_AGE_MONTHS
                    )],
                    remediation: Some(STALE_REMEDIATION.to_string()),
                });
            }
            fallbacks.push(FallbackReason::StaleData);
            &screened.stale
        } else {
            &screened.primary
        };

        // -- Weighted cap rate ---------------------------------------------
        let trend = fit_market_trend(&comps.data, date);
        let mut weighted = weigh_comps(subject, working);
        for w in &mut weighted {
            w.adjusted_cap_rate = time_adjust(w.comp.cap_rate_pct, w.months_since_sale, trend.as_ref());
        }

        let mut points: Vec<WeightedPoint> = weighted
            .iter()
            .map(|w| WeightedPoint {
                value: w.adjusted_cap_rate,
                weight: w.raw_weight,
            })
            .collect();
        canonical_sort(&mut points);
        let trimmed = trim_tails(&points, self.config.trim_fraction);
        let weighted_cap = weighted_median(&trimmed);
        let dispersion_bps = weighted_iqr_bps(&trimmed);

        // -- Degradation rules ---------------------------------------------
        let low_sample = working.len() < self.config.min_comps;
        let cap_rate = match (low_sample, weighted_cap) {
            (false, Some(cap)) => cap,
            _ => {
                fallbacks.insert(0, FallbackReason::LowSampleSize);
                trailing_market_median(&comps.data, date).unwrap_or(fundamentals.data.cap_rate_avg)
            }
        };
        if dispersion_bps > self.config.dispersion_threshold_bps {
            fallbacks.push(FallbackReason::HighDispersion);
        }

        let mut half_width = self.calibration.half_width;
        if fallbacks.contains(&FallbackReason::LowSampleSize) {
            half_width = half_width.max(self.config.low_sample_half_width);
        }
        if fallbacks.contains(&FallbackReason::HighDispersion) {
            half_width += self.config.dispersion_widen_bps / 10_000.0;
        }
        if fallbacks.contains(&FallbackReason::StaleData) {
            half_width += self.config.stale_widen_bps / 10_000.0;
        }

        // -- Value ------------------------------------------------------------
        let income_value = capitalize(noi, cap_rate)?;
        let reconciled = reconcile(income_value, working, subject.building_sf);
        let point = reconciled.value;

        let projection = forecast(
            noi,
            cap_rate,
            &fundamentals.data,
            &macro_snapshot.data,
            &self.config.forecast,
        )?;

        let confidence = confidence_score(&ConfidenceInputs {
            comp_count: working.len(),
            freshness: vec![macro_snapshot.freshness, fundamentals.freshness, comps.freshness],
            disagreement_pct: reconciled.disagreement_pct,
            cap_rate_applied: cap_rate,
            market_cap_rate_avg: fundamentals.data.cap_rate_avg,
        });

        // -- Warnings -----------------------------------------------------------
        let mut warnings: Vec<String> = fallbacks.iter().map(|f| f.as_str().to_string()).collect();
        if working.is_empty() {
            warnings.push(WARN_NO_COMPARABLES.to_string());
        }
        if let Some(w) = reconciled.warning {
            warnings.push(w.to_string());
        }
        for (kind, freshness) in [
            (SourceKind::Macro, macro_snapshot.freshness),
            (SourceKind::Fundamentals, fundamentals.freshness),
            (SourceKind::Comps, comps.freshness),
        ] {
            if !freshness.is_fresh() {
                warnings.push(format!("{}_{}", kind.as_str(), freshness.to_string().to_lowercase()));
            }
        }

        debug!(
            market = %subject.market_id,
            comps = working.len(),
            rejected = screened.rejected.len(),
            cap_rate,
            dispersion_bps,
            trend_slope = trend.map(|t| t.slope_per_month),
            "Estimate computed"
        );

        Ok(ValuationResult {
            market_id: subject.market_id.clone(),
            valuation_date: date,
            point,
            low: (point * (1.0 - half_width)).max(0.0),
            high: point * (1.0 + half_width),
            cap_rate_applied: cap_rate,
            confidence,
            half_width_pct: half_width,
            method_version: METHOD_VERSION.to_string(),
            comp_count: working.len(),
            dispersion_bps,
            fallback_reason: fallbacks.first().copied(),
            warnings,
            noi_annual: noi,
            income_value,
            sales_comparison_value: reconciled.sales_comparison_value,
            disagreement_pct: reconciled.disagreement_pct,
            forecast: projection,
            provenance: ProvenanceBlock {
                macro_data: macro_snapshot.provenance.clone(),
                fundamentals: fundamentals.provenance.clone(),
                comps: comps.provenance.clone(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
