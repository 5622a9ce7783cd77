//! Calibration module.
//!
//! Sizes the valuation interval from backtest residuals using split
//! conformal prediction: the interval half-width is the
//! `ceil((n+1) * coverage) / n` empirical quantile of absolute percentage
//! errors over a rolling window. With too little history a fixed default
//! is used instead.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_HALF_WIDTH: f64 = 0.10;
pub const DEFAULT_TARGET_COVERAGE: f64 = 0.80;
pub const DEFAULT_WINDOW: usize = 1_000;
pub const MIN_OBSERVATIONS: usize = 50;

// ---------------------------------------------------------------------------
// Calibration data
// ---------------------------------------------------------------------------

/// One backtest pair: what was predicted and what the property sold for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestObservation {
    pub predicted: f64,
    pub realized: f64,
}

impl BacktestObservation {
    /// |predicted − realized| / realized, or `None` for unusable pairs.
    pub fn abs_pct_error(&self) -> Option<f64> {
        if !(self.realized.is_finite() && self.realized > 0.0 && self.predicted.is_finite()) {
            return None;
        }
        Some((self.predicted - self.realized).abs() / self.realized)
    }
}

/// Snapshot handed to the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub half_width: f64,
    pub sample_size: usize,
    pub target_coverage: f64,
    /// True when the default was used for lack of history.
    pub is_default: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            half_width: DEFAULT_HALF_WIDTH,
            sample_size: 0,
            target_coverage: DEFAULT_TARGET_COVERAGE,
            is_default: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

pub struct ConformalCalibrator {
    errors: VecDeque<f64>,
    window: usize,
    target_coverage: f64,
    skipped: usize,
}

impl ConformalCalibrator {
    pub fn new(target_coverage: f64, window: usize) -> Self {
        Self {
            errors: VecDeque::with_capacity(window.min(DEFAULT_WINDOW)),
            window: window.max(1),
            target_coverage,
            skipped: 0,
        }
    }

    /// Add a backtest pair. The oldest residual is dropped once the
    /// window is full.
    pub fn add_observation(&mut self, obs: BacktestObservation) {
        match obs.abs_pct_error() {
            Some(err) => {
                if self.errors.len() == self.window {
                    self.errors.pop_front();
                }
                self.errors.push_back(err);
            }
            None => self.skipped += 1,
        }
    }

    pub fn add_observations(&mut self, observations: impl IntoIterator<Item = BacktestObservation>) {
        for obs in observations {
            self.add_observation(obs);
        }
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Conformal quantile of the window, `None` below the minimum sample.
    pub fn conformal_quantile(&self) -> Option<f64> {
        let n = self.errors.len();
        if n < MIN_OBSERVATIONS {
            return None;
        }
        let mut sorted: Vec<f64> = self.errors.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = ((n as f64 + 1.0) * self.target_coverage).ceil() as usize;
        Some(sorted[rank.clamp(1, n) - 1])
    }

    pub fn calibration(&self) -> Calibration {
        match self.conformal_quantile() {
            Some(q) => Calibration {
                half_width: q,
                sample_size: self.errors.len(),
                target_coverage: self.target_coverage,
                is_default: false,
            },
            None => Calibration {
                sample_size: self.errors.len(),
                target_coverage: self.target_coverage,
                ..Calibration::default()
            },
        }
    }

    /// Share of window residuals that fall inside `half_width`.
    pub fn empirical_coverage(&self, half_width: f64) -> f64 {
        if self.errors.is_empty() {
            return 0.0;
        }
        let inside = self.errors.iter().filter(|e| **e <= half_width).count();
        inside as f64 / self.errors.len() as f64
    }
}

impl Default for ConformalCalibrator {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_COVERAGE, DEFAULT_WINDOW)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
