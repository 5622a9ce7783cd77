//! Comparable-sale screening.
//!
//! Drops sales that cannot inform a cap rate (out-of-range cap, price
//! outlier for the market, unverified, sold after the valuation date) and
//! splits the survivors by age: sales within 18 months are primary, older
//! ones are kept aside for the stale-data fallback.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

use crate::types::ComparableSale;

pub const MIN_CAP_RATE_PCT: f64 = 2.0;
pub const MAX_CAP_RATE_PCT: f64 = 15.0;
pub const MAX_PRIMARY_AGE_MONTHS: f64 = 18.0;
pub const TRAILING_WINDOW_MONTHS: f64 = 12.0;
pub const PRICE_BAND_LOW_PCT: f64 = 5.0;
pub const PRICE_BAND_HIGH_PCT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CapRateOutOfRange,
    PriceOutlier,
    Unverified,
    SoldAfterValuationDate,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::CapRateOutOfRange => "cap_rate_out_of_range",
            RejectReason::PriceOutlier => "price_outlier",
            RejectReason::Unverified => "unverified",
            RejectReason::SoldAfterValuationDate => "sold_after_valuation_date",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Valid sales within the primary age window.
    pub primary: Vec<ComparableSale>,
    /// Valid sales older than the primary window.
    pub stale: Vec<ComparableSale>,
    pub rejected: Vec<(String, RejectReason)>,
    /// Inclusive P5..P95 price-per-sf band of the supplied set.
    pub price_band: Option<(f64, f64)>,
}

impl FilterOutcome {
    pub fn valid_count(&self) -> usize {
        self.primary.len() + self.stale.len()
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile_nearest_rank(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((pct / 100.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// P5..P95 price-per-sf band over every sale supplied for the market.
pub fn price_band(comps: &[ComparableSale]) -> Option<(f64, f64)> {
    let mut prices: Vec<f64> = comps
        .iter()
        .map(|c| c.price_per_sf)
        .filter(|p| p.is_finite())
        .collect();
    prices.sort_by(f64::total_cmp);
    Some((
        percentile_nearest_rank(&prices, PRICE_BAND_LOW_PCT)?,
        percentile_nearest_rank(&prices, PRICE_BAND_HIGH_PCT)?,
    ))
}

fn reject_reason(
    comp: &ComparableSale,
    band: Option<(f64, f64)>,
    valuation_date: NaiveDate,
) -> Option<RejectReason> {
    if comp.sale_date > valuation_date {
        return Some(RejectReason::SoldAfterValuationDate);
    }
    if !(MIN_CAP_RATE_PCT..=MAX_CAP_RATE_PCT).contains(&comp.cap_rate_pct) {
        return Some(RejectReason::CapRateOutOfRange);
    }
    if let Some((low, high)) = band {
        if !(low..=high).contains(&comp.price_per_sf) {
            return Some(RejectReason::PriceOutlier);
        }
    }
    if !comp.is_verified() {
        return Some(RejectReason::Unverified);
    }
    None
}

pub fn filter_comps(comps: &[ComparableSale], valuation_date: NaiveDate) -> FilterOutcome {
    let band = price_band(comps);
    let mut outcome = FilterOutcome {
        price_band: band,
        ..FilterOutcome::default()
    };

    for comp in comps {
        match reject_reason(comp, band, valuation_date) {
            Some(reason) => outcome.rejected.push((comp.id.clone(), reason)),
            None if comp.months_since(valuation_date) > MAX_PRIMARY_AGE_MONTHS => {
                outcome.stale.push(comp.clone())
            }
            None => outcome.primary.push(comp.clone()),
        }
    }
    outcome
}

/// Plain median cap rate of verified, in-range sales from the trailing
/// twelve months. Used when too few comps survive screening.
pub fn trailing_market_median(comps: &[ComparableSale], valuation_date: NaiveDate) -> Option<f64> {
    let mut caps: Vec<f64> = comps
        .iter()
        .filter(|c| c.is_verified())
        .filter(|c| c.sale_date <= valuation_date)
        .filter(|c| c.months_since(valuation_date) <= TRAILING_WINDOW_MONTHS)
        .filter(|c| (MIN_CAP_RATE_PCT..=MAX_CAP_RATE_PCT).contains(&c.cap_rate_pct))
        .map(|c| c.cap_rate_pct)
        .collect();
    caps.sort_by(f64::total_cmp);
    super::aggregate::median_sorted(&caps)
}
