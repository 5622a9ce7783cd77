//! Similarity weights for comparable sales.
//!
//! Each comp's raw weight is the product of four factors:
//!
//! - recency: `exp(-ln2 * months / 12)`, a 12-month half-life
//! - distance: `exp(-miles / 15)`, doubled for the subject's submarket;
//!   the exponential term is dropped when either side lacks coordinates
//! - size: Gaussian on `ln(comp_sf / subject_sf)` with sigma 0.35
//! - vintage: Gaussian on the year-built gap with sigma 10 years, only
//!   when both years are known
//!
//! Raw weights depend only on the comp and the subject, never on the
//! other comps, so aggregation can sum them in a canonical order.

use serde::Serialize;

use crate::types::{ComparableSale, SubjectProperty};

pub const RECENCY_HALF_LIFE_MONTHS: f64 = 12.0;
pub const DISTANCE_SCALE_MI: f64 = 15.0;
pub const SAME_SUBMARKET_MULTIPLIER: f64 = 2.0;
pub const SIZE_LOG_SIGMA: f64 = 0.35;
pub const AGE_SIGMA_YEARS: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct WeightedComp {
    pub comp: ComparableSale,
    pub months_since_sale: f64,
    pub distance_mi: Option<f64>,
    pub same_submarket: bool,
    pub recency_factor: f64,
    pub distance_factor: f64,
    pub size_factor: f64,
    pub age_factor: Option<f64>,
    pub raw_weight: f64,
    /// Normalized weight; all comps in one set sum to 1.
    pub weight: f64,
    /// Cap rate after the market-trend time adjustment.
    pub adjusted_cap_rate: f64,
}

pub fn recency_factor(months_since_sale: f64) -> f64 {
    (-std::f64::consts::LN_2 * months_since_sale.max(0.0) / RECENCY_HALF_LIFE_MONTHS).exp()
}

pub fn distance_factor(distance_mi: Option<f64>, same_submarket: bool) -> f64 {
    let base = distance_mi.map(|d| (-d / DISTANCE_SCALE_MI).exp()).unwrap_or(1.0);
    if same_submarket {
        base * SAME_SUBMARKET_MULTIPLIER
    } else {
        base
    }
}

pub fn size_factor(comp_sf: f64, subject_sf: f64) -> f64 {
    let z = (comp_sf / subject_sf).ln() / SIZE_LOG_SIGMA;
    (-0.5 * z * z).exp()
}

pub fn age_factor(comp_year: Option<i32>, subject_year: Option<i32>) -> Option<f64> {
    let (c, s) = (comp_year?, subject_year?);
    let z = f64::from(c - s) / AGE_SIGMA_YEARS;
    Some((-0.5 * z * z).exp())
}

fn same_submarket(subject: &SubjectProperty, comp: &ComparableSale) -> bool {
    subject
        .submarket
        .as_deref()
        .map(|s| !s.trim().is_empty() && s.trim().eq_ignore_ascii_case(comp.submarket.trim()))
        .unwrap_or(false)
}

/// Weigh every comp against the subject and normalize.
pub fn weigh_comps(subject: &SubjectProperty, comps: &[ComparableSale]) -> Vec<WeightedComp> {
    let mut weighted: Vec<WeightedComp> = comps
        .iter()
        .map(|comp| {
            let months = comp.months_since(subject.valuation_date);
            let distance = match (subject.location, comp.location) {
                (Some(a), Some(b)) => Some(a.distance_mi(&b)),
                _ => None,
            };
            let same = same_submarket(subject, comp);
            let recency = recency_factor(months);
            let dist = distance_factor(distance, same);
            let size = size_factor(comp.building_sf, subject.building_sf);
            let age = age_factor(comp.year_built, subject.year_built);
            let raw = recency * dist * size * age.unwrap_or(1.0);
            WeightedComp {
                comp: comp.clone(),
                months_since_sale: months,
                distance_mi: distance,
                same_submarket: same,
                recency_factor: recency,
                distance_factor: dist,
                size_factor: size,
                age_factor: age,
                raw_weight: raw,
                weight: 0.0,
                adjusted_cap_rate: comp.cap_rate_pct,
            }
        })
        .collect();

    let total: f64 = weighted.iter().map(|w| w.raw_weight).sum();
    if total > 0.0 && total.is_finite() {
        for w in &mut weighted {
            w.weight = w.raw_weight / total;
        }
    } else if !weighted.is_empty() {
        // Every factor underflowed: fall back to equal weights
        let equal = 1.0 / weighted.len() as f64;
        for w in &mut weighted {
            w.raw_weight = equal;
            w.weight = equal;
        }
    }
    weighted
}
