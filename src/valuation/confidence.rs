//! Rule-based confidence score.
//!
//! Starts from a base of 0.85 and applies additive adjustments for
//! sample size, source freshness, engine disagreement and how far the
//! applied cap rate sits from the market average. Clamped to [0.1, 1.0].

use crate::types::Freshness;

pub const BASE_SCORE: f64 = 0.85;
pub const MIN_SCORE: f64 = 0.1;
pub const MAX_SCORE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ConfidenceInputs {
    pub comp_count: usize,
    pub freshness: Vec<Freshness>,
    pub disagreement_pct: Option<f64>,
    pub cap_rate_applied: f64,
    pub market_cap_rate_avg: f64,
}

fn sample_adjustment(comp_count: usize) -> f64 {
    match comp_count {
        0..=7 => -0.15,
        8..=11 => 0.0,
        _ => 0.05,
    }
}

fn freshness_adjustment(freshness: &[Freshness]) -> f64 {
    freshness
        .iter()
        .map(|f| match f {
            Freshness::Fresh => 0.0,
            Freshness::Stale => -0.05,
            Freshness::Expired => -0.10,
        })
        .sum()
}

fn disagreement_adjustment(disagreement_pct: Option<f64>) -> f64 {
    match disagreement_pct {
        Some(d) if d > 0.15 => -0.10,
        _ => 0.0,
    }
}

fn cap_variance_adjustment(cap_rate_applied: f64, market_avg: f64) -> f64 {
    let gap_bps = (cap_rate_applied - market_avg).abs() * 100.0;
    if gap_bps > 200.0 {
        -0.10
    } else if gap_bps > 100.0 {
        -0.05
    } else {
        0.0
    }
}

pub fn confidence_score(inputs: &ConfidenceInputs) -> f64 {
    let score = BASE_SCORE
        + sample_adjustment(inputs.comp_count)
        + freshness_adjustment(&inputs.freshness)
        + disagreement_adjustment(inputs.disagreement_pct)
        + cap_variance_adjustment(inputs.cap_rate_applied, inputs.market_cap_rate_avg);
    score.clamp(MIN_SCORE, MAX_SCORE)
}
