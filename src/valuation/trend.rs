//! Market cap-rate trend and time adjustment.
//!
//! A Theil–Sen line (median of pairwise slopes) is fitted to the market's
//! verified sales as (months before valuation date, cap rate). Each comp's
//! cap rate is then carried forward to the valuation date along that
//! slope. Without at least 24 months of history no adjustment is made.

use chrono::NaiveDate;
use serde::Serialize;

use super::aggregate::median;
use super::filter::{MAX_CAP_RATE_PCT, MIN_CAP_RATE_PCT};
use crate::types::ComparableSale;

pub const MIN_TREND_SPAN_MONTHS: f64 = 24.0;
pub const MIN_TREND_POINTS: usize = 4;

/// Pairs closer than this in time are ignored when computing slopes.
const MIN_PAIR_GAP_MONTHS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapRateTrend {
    /// Change in cap rate (percentage points) per month forward in time.
    pub slope_per_month: f64,
    pub span_months: f64,
    pub points: usize,
}

/// Median of pairwise slopes. `None` with fewer than two usable pairs.
pub fn theil_sen_slope(points: &[(f64, f64)]) -> Option<f64> {
    let mut slopes = Vec::new();
    for (i, &(x1, y1)) in points.iter().enumerate() {
        for &(x2, y2) in &points[i + 1..] {
            let dx = x2 - x1;
            if dx.abs() >= MIN_PAIR_GAP_MONTHS {
                slopes.push((y2 - y1) / dx);
            }
        }
    }
    if slopes.len() < 2 {
        return None;
    }
    median(&slopes)
}

/// Fit the market trend from all verified, in-range sales up to the
/// valuation date.
pub fn fit_market_trend(comps: &[ComparableSale], valuation_date: NaiveDate) -> Option<CapRateTrend> {
    let mut points: Vec<(f64, f64)> = comps
        .iter()
        .filter(|c| c.is_verified() && c.sale_date <= valuation_date)
        .filter(|c| (MIN_CAP_RATE_PCT..=MAX_CAP_RATE_PCT).contains(&c.cap_rate_pct))
        // x grows forward in time; the valuation date is x = 0
        .map(|c| (-c.months_since(valuation_date), c.cap_rate_pct))
        .collect();
    if points.len() < MIN_TREND_POINTS {
        return None;
    }
    // Canonical order so the fit does not depend on input order
    points.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)));

    let span = points.last()?.0 - points.first()?.0;
    if span < MIN_TREND_SPAN_MONTHS {
        return None;
    }
    let slope = theil_sen_slope(&points)?;
    Some(CapRateTrend {
        slope_per_month: slope,
        span_months: span,
        points: points.len(),
    })
}

/// Carry a comp's cap rate forward to the valuation date.
///
/// The result stays inside the plausible cap-rate band used to screen
/// comps, so a steep trend cannot push an old sale to zero or below.
pub fn time_adjust(cap_rate_pct: f64, months_since_sale: f64, trend: Option<&CapRateTrend>) -> f64 {
    match trend {
        Some(t) => (cap_rate_pct + t.slope_per_month * months_since_sale)
            .clamp(MIN_CAP_RATE_PCT, MAX_CAP_RATE_PCT),
        None => cap_rate_pct,
    }
}
