//! Freshness classification.
//!
//! Pure functions that grade a record's age against the threshold for
//! its source. Used by the fetch layer when serving values and again by
//! the emitter just before delivery.

use chrono::{Duration, NaiveDate};

use crate::types::{Freshness, SourceKind};

/// Records older than this multiple of the threshold are expired.
pub const EXPIRY_MULTIPLE: f64 = 1.5;

/// Per-source freshness thresholds, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub macro_days: i64,
    pub fundamentals_days: i64,
    pub comps_days: i64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            macro_days: 7,
            fundamentals_days: 90,
            comps_days: 180,
        }
    }
}

impl FreshnessPolicy {
    pub fn threshold(&self, kind: SourceKind) -> Duration {
        let days = match kind {
            SourceKind::Macro => self.macro_days,
            SourceKind::Fundamentals => self.fundamentals_days,
            SourceKind::Comps => self.comps_days,
        };
        Duration::days(days)
    }

    /// Grade a record dated `as_of`, observed on `today`.
    pub fn classify(&self, kind: SourceKind, as_of: NaiveDate, today: NaiveDate) -> Freshness {
        classify(today - as_of, self.threshold(kind))
    }
}

/// FRESH below the threshold, STALE below 1.5x, EXPIRED beyond.
///
/// A record dated in the future (negative age) is treated as fresh.
pub fn classify(age: Duration, threshold: Duration) -> Freshness {
    if age < threshold {
        return Freshness::Fresh;
    }
    let expiry_secs = threshold.num_seconds() as f64 * EXPIRY_MULTIPLE;
    if (age.num_seconds() as f64) < expiry_secs {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}
