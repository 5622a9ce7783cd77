//! Weighted robust statistics over (value, weight) points.
//!
//! Points are put in a canonical order (value, then weight) before any
//! cumulative sum, so results are bit-for-bit identical for any input
//! permutation.

/// Fraction of total weight removed, split evenly across both tails.
pub const TRIM_FRACTION: f64 = 0.05;

/// Tolerance for detecting an exact 0.5 cumulative-weight boundary.
const BOUNDARY_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedPoint {
    pub value: f64,
    pub weight: f64,
}

/// Canonical order: ascending value, ties broken by weight.
pub fn canonical_sort(points: &mut [WeightedPoint]) {
    points.sort_by(|a, b| {
        a.value
            .total_cmp(&b.value)
            .then_with(|| a.weight.total_cmp(&b.weight))
    });
}

fn total_weight(points: &[WeightedPoint]) -> f64 {
    points.iter().map(|p| p.weight).sum()
}

/// Remove `fraction / 2` of the total weight from each tail.
///
/// A point survives when any part of its weight mass lies inside the
/// kept band. Input must be canonically sorted. If trimming would leave
/// nothing (a single dominant point), the input is returned unchanged.
pub fn trim_tails(points: &[WeightedPoint], fraction: f64) -> Vec<WeightedPoint> {
    let total = total_weight(points);
    if points.len() < 3 || total <= 0.0 {
        return points.to_vec();
    }
    let tail = total * fraction / 2.0;
    let mut kept = Vec::with_capacity(points.len());
    let mut before = 0.0;
    for p in points {
        let after = before + p.weight;
        if after > tail && before < total - tail {
            kept.push(*p);
        }
        before = after;
    }
    if kept.is_empty() {
        points.to_vec()
    } else {
        kept
    }
}

/// Weighted quantile of canonically sorted points: the first value whose
/// cumulative weight reaches `q` of the total.
pub fn weighted_quantile(points: &[WeightedPoint], q: f64) -> Option<f64> {
    let total = total_weight(points);
    if points.is_empty() || total <= 0.0 {
        return None;
    }
    let target = q.clamp(0.0, 1.0) * total;
    let mut cum = 0.0;
    for p in points {
        cum += p.weight;
        if cum >= target - BOUNDARY_EPS * total {
            return Some(p.value);
        }
    }
    points.last().map(|p| p.value)
}

/// Weighted median of canonically sorted points. When the cumulative
/// weight lands exactly on one half, the two neighbouring values are
/// averaged.
pub fn weighted_median(points: &[WeightedPoint]) -> Option<f64> {
    let total = total_weight(points);
    if points.is_empty() || total <= 0.0 {
        return None;
    }
    let half = total / 2.0;
    let mut cum = 0.0;
    for (i, p) in points.iter().enumerate() {
        cum += p.weight;
        if (cum - half).abs() <= BOUNDARY_EPS * total {
            return Some(match points.get(i + 1) {
                Some(next) => (p.value + next.value) / 2.0,
                None => p.value,
            });
        }
        if cum > half {
            return Some(p.value);
        }
    }
    points.last().map(|p| p.value)
}

/// Weighted interquartile range, in basis points of cap rate.
pub fn weighted_iqr_bps(points: &[WeightedPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    match (weighted_quantile(points, 0.25), weighted_quantile(points, 0.75)) {
        (Some(q1), Some(q3)) => (q3 - q1) * 100.0,
        _ => 0.0,
    }
}

/// Plain median of an ascending slice.
pub fn median_sorted(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Plain median of unsorted values.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    median_sorted(&sorted)
}
