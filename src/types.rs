//! Shared types for the APPRAISER valuation engine.
//!
//! These types form the data model used across all modules: upstream
//! records (macro, fundamentals, comparable sales), provenance and
//! freshness metadata, the inbound request, the finished valuation, and
//! the error taxonomy surfaced to callers.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Valuation method identifier carried on every result and event.
pub const METHOD_VERSION: &str = "income-cap/1.4.0";

/// Model name carried on every emitted event.
pub const MODEL_NAME: &str = "appraiser-income-approach";

/// Average month length in days, used for sale-age arithmetic.
pub const DAYS_PER_MONTH: f64 = 30.4375;

// ---------------------------------------------------------------------------
// Source identity & freshness
// ---------------------------------------------------------------------------

/// Upstream data source category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Macro,
    Fundamentals,
    Comps,
}

impl SourceKind {
    /// All known source kinds (useful for iteration).
    pub const ALL: &'static [SourceKind] = &[
        SourceKind::Macro,
        SourceKind::Fundamentals,
        SourceKind::Comps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Macro => "macro",
            SourceKind::Fundamentals => "fundamentals",
            SourceKind::Comps => "comps",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Age classification of a fetched value relative to its source threshold.
///
/// Ordered from best to worst so `max()` picks the most degraded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        *self == Freshness::Fresh
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "FRESH"),
            Freshness::Stale => write!(f, "STALE"),
            Freshness::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Source attribution attached to every fetched value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub as_of: NaiveDate,
    pub from_cache: bool,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} as of {}{}",
            self.source,
            self.as_of,
            if self.from_cache { " (cached)" } else { "" },
        )
    }
}

/// A value returned by the fetch layer, with its provenance and freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fetched<T> {
    pub data: T,
    pub provenance: Provenance,
    pub freshness: Freshness,
}

/// Provenance for the three inputs of one valuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceBlock {
    #[serde(rename = "macro")]
    pub macro_data: Provenance,
    pub fundamentals: Provenance,
    pub comps: Provenance,
}

impl ProvenanceBlock {
    /// Look up one source's provenance by kind.
    pub fn get(&self, kind: SourceKind) -> &Provenance {
        match kind {
            SourceKind::Macro => &self.macro_data,
            SourceKind::Fundamentals => &self.fundamentals,
            SourceKind::Comps => &self.comps,
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream records
// ---------------------------------------------------------------------------

/// Macro rates snapshot. All rates in percent (4.33 = 4.33%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSnapshot {
    pub fed_funds_rate: f64,
    pub treasury_10y: f64,
    pub as_of_date: NaiveDate,
    pub source: String,
    /// Fed funds rate roughly one year before `as_of_date`.
    #[serde(default)]
    pub fed_funds_prior: Option<f64>,
    /// 10-year Treasury yield roughly one year before `as_of_date`.
    #[serde(default)]
    pub treasury_10y_prior: Option<f64>,
}

impl MacroSnapshot {
    /// Term spread (10y − fed funds) in percentage points.
    pub fn term_spread(&self) -> f64 {
        self.treasury_10y - self.fed_funds_rate
    }

    /// Twelve-month change in the term spread, if prior values are known.
    pub fn term_spread_change(&self) -> Option<f64> {
        match (self.treasury_10y_prior, self.fed_funds_prior) {
            (Some(t), Some(f)) => Some(self.term_spread() - (t - f)),
            _ => None,
        }
    }
}

/// Market-level fundamentals. Rates are fractions (0.12 = 12% vacancy),
/// except `cap_rate_avg` which is a percentage like every cap rate here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketFundamentals {
    pub market_id: String,
    pub vacancy_rate: f64,
    pub asking_rent_psf: f64,
    pub rent_growth_yoy: f64,
    pub cap_rate_avg: f64,
    pub as_of_date: NaiveDate,
    #[serde(default)]
    pub vacancy_rate_prior: Option<f64>,
    #[serde(default)]
    pub net_absorption_sf: Option<f64>,
    #[serde(default)]
    pub deliveries_sf: Option<f64>,
}

impl MarketFundamentals {
    /// Year-over-year vacancy change in percentage points.
    pub fn vacancy_change_pts(&self) -> Option<f64> {
        self.vacancy_rate_prior
            .map(|prior| (self.vacancy_rate - prior) * 100.0)
    }

    /// Net absorption over new deliveries, clamped to [0, 3].
    pub fn absorption_ratio(&self) -> Option<f64> {
        match (self.net_absorption_sf, self.deliveries_sf) {
            (Some(absorbed), Some(delivered)) if delivered > 0.0 => {
                Some((absorbed / delivered).clamp(0.0, 3.0))
            }
            _ => None,
        }
    }
}

/// Verification state of a recorded sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Pending,
    Unverified,
}

impl std::str::FromStr for VerificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "verified" | "confirmed" => Ok(VerificationStatus::Verified),
            "pending" => Ok(VerificationStatus::Pending),
            "unverified" | "unconfirmed" => Ok(VerificationStatus::Unverified),
            _ => Err(anyhow::anyhow!("Unknown verification status: {s}")),
        }
    }
}

/// WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Great-circle distance in statute miles.
    pub fn distance_mi(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_MI: f64 = 3958.8;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_MI * a.sqrt().asin()
    }
}

/// A recorded comparable sale. Read-only once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    pub id: String,
    pub market_id: String,
    pub submarket: String,
    pub sale_date: NaiveDate,
    pub building_sf: f64,
    pub price_per_sf: f64,
    pub cap_rate_pct: f64,
    pub year_built: Option<i32>,
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl fmt::Display for ComparableSale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {:.0}sf @ ${:.0}/sf cap={:.2}% sold {}",
            self.market_id,
            self.id,
            self.building_sf,
            self.price_per_sf,
            self.cap_rate_pct,
            self.sale_date,
        )
    }
}

impl ComparableSale {
    pub fn is_verified(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }

    /// Months elapsed between the sale and `date` (never negative).
    pub fn months_since(&self, date: NaiveDate) -> f64 {
        ((date - self.sale_date).num_days() as f64 / DAYS_PER_MONTH).max(0.0)
    }

    /// Boundary validation applied when rows are decoded from the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("empty id".into());
        }
        if !(self.building_sf.is_finite() && self.building_sf > 0.0) {
            return Err(format!("building_sf must be positive, got {}", self.building_sf));
        }
        if !(self.price_per_sf.is_finite() && self.price_per_sf > 0.0) {
            return Err(format!("price_per_sf must be positive, got {}", self.price_per_sf));
        }
        if !(self.cap_rate_pct.is_finite() && self.cap_rate_pct > 0.0) {
            return Err(format!("cap_rate_pct must be positive, got {}", self.cap_rate_pct));
        }
        if let Some(loc) = self.location {
            if !(-90.0..=90.0).contains(&loc.lat) || !(-180.0..=180.0).contains(&loc.lon) {
                return Err(format!("invalid coordinates ({}, {})", loc.lat, loc.lon));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound request
// ---------------------------------------------------------------------------

pub const MIN_BUILDING_SF: f64 = 1_000.0;
pub const MAX_BUILDING_SF: f64 = 10_000_000.0;
pub const MIN_YEAR_BUILT: i32 = 1800;

/// Inbound valuation request as received from callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationRequest {
    pub market_id: String,
    pub building_sf: f64,
    #[serde(default)]
    pub noi_annual: Option<f64>,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default)]
    pub submarket: Option<String>,
    #[serde(default)]
    pub rent_psf: Option<f64>,
    #[serde(default)]
    pub opex_psf: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub valuation_date: Option<NaiveDate>,
    #[serde(default)]
    pub acknowledge_stale_data: bool,
}

impl ValuationRequest {
    /// Validate every field and build the subject property.
    ///
    /// All violations are collected so the caller sees every problem at once.
    pub fn validate(
        &self,
        known_markets: &[String],
        today: NaiveDate,
    ) -> Result<SubjectProperty, ValuationError> {
        let mut reasons = Vec::new();
        let market_id = self.market_id.trim().to_lowercase();

        if market_id.is_empty() {
            reasons.push("market_id is required".to_string());
        } else if !known_markets.iter().any(|m| m.eq_ignore_ascii_case(&market_id)) {
            reasons.push(format!("unknown market_id: {}", self.market_id));
        }

        if !(self.building_sf.is_finite()
            && (MIN_BUILDING_SF..=MAX_BUILDING_SF).contains(&self.building_sf))
        {
            reasons.push(format!(
                "building_sf must be between {MIN_BUILDING_SF:.0} and {MAX_BUILDING_SF:.0}, got {}",
                self.building_sf
            ));
        }

        if let Some(noi) = self.noi_annual {
            if !(noi.is_finite() && noi > 0.0) {
                reasons.push(format!("noi_annual must be > 0 when present, got {noi}"));
            }
        }

        if let Some(year) = self.year_built {
            if !(MIN_YEAR_BUILT..=today.year()).contains(&year) {
                reasons.push(format!(
                    "year_built must be between {MIN_YEAR_BUILT} and {}, got {year}",
                    today.year()
                ));
            }
        }

        for (name, value) in [("rent_psf", self.rent_psf), ("opex_psf", self.opex_psf)] {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    reasons.push(format!("{name} must be >= 0 when present, got {v}"));
                }
            }
        }

        let location = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => {
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
                    Some(GeoPoint { lat, lon })
                } else {
                    reasons.push(format!("invalid coordinates ({lat}, {lon})"));
                    None
                }
            }
            (None, None) => None,
            _ => {
                reasons.push("latitude and longitude must be supplied together".to_string());
                None
            }
        };

        let valuation_date = self.valuation_date.unwrap_or(today);
        if valuation_date > today {
            reasons.push(format!("valuation_date {valuation_date} is in the future"));
        }

        if !reasons.is_empty() {
            return Err(ValuationError::Validation { reasons });
        }

        Ok(SubjectProperty {
            market_id,
            submarket: self.submarket.clone(),
            building_sf: self.building_sf,
            year_built: self.year_built,
            noi_annual: self.noi_annual,
            rent_psf: self.rent_psf,
            opex_psf: self.opex_psf,
            location,
            valuation_date,
            acknowledge_stale_data: self.acknowledge_stale_data,
        })
    }
}

/// A validated subject property ready for estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectProperty {
    pub market_id: String,
    pub submarket: Option<String>,
    pub building_sf: f64,
    pub year_built: Option<i32>,
    pub noi_annual: Option<f64>,
    pub rent_psf: Option<f64>,
    pub opex_psf: Option<f64>,
    pub location: Option<GeoPoint>,
    pub valuation_date: NaiveDate,
    pub acknowledge_stale_data: bool,
}

impl SubjectProperty {
    /// Helper to build a test subject with sensible defaults.
    #[cfg(test)]
    pub fn sample() -> Self {
        SubjectProperty {
            market_id: "dfw".to_string(),
            submarket: Some("uptown".to_string()),
            building_sf: 100_000.0,
            year_built: Some(2005),
            noi_annual: Some(1_500_000.0),
            rent_psf: None,
            opex_psf: None,
            location: None,
            valuation_date: NaiveDate::from_ymd_opt(2026, 6, 30).expect("valid date"),
            acknowledge_stale_data: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Valuation output
// ---------------------------------------------------------------------------

/// Degradation rule that fired during estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    LowSampleSize,
    StaleData,
    HighDispersion,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::LowSampleSize => "low_sample_size",
            FallbackReason::StaleData => "stale_data",
            FallbackReason::HighDispersion => "high_dispersion",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One input to the cap-rate forecast and its contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub name: String,
    /// Raw driver value (percentage points or ratio).
    pub input: f64,
    /// Contribution to the forecast cap rate, in basis points.
    pub contribution_bps: f64,
}

/// Twelve-month forward projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub noi: f64,
    pub cap_rate: f64,
    pub value: f64,
    /// True when the raw cap-rate change hit the ±150 bps clamp.
    pub clamped: bool,
    pub drivers: Vec<Driver>,
}

/// The finished, immutable valuation for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationResult {
    pub market_id: String,
    pub valuation_date: NaiveDate,
    pub point: f64,
    pub low: f64,
    pub high: f64,
    pub cap_rate_applied: f64,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    /// Interval half-width as a fraction of the point value.
    pub half_width_pct: f64,
    #[serde(rename = "model_version")]
    pub method_version: String,
    pub comp_count: usize,
    pub dispersion_bps: f64,
    pub fallback_reason: Option<FallbackReason>,
    pub warnings: Vec<String>,
    pub noi_annual: f64,
    pub income_value: f64,
    pub sales_comparison_value: Option<f64>,
    pub disagreement_pct: Option<f64>,
    pub forecast: ForecastResult,
    pub provenance: ProvenanceBlock,
}

impl fmt::Display for ValuationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] value=${:.0} (${:.0}–${:.0}) cap={:.2}% conf={:.0}% comps={}{}",
            self.market_id,
            self.point,
            self.low,
            self.high,
            self.cap_rate_applied,
            self.confidence * 100.0,
            self.comp_count,
            match self.fallback_reason {
                Some(r) => format!(" fallback={r}"),
                None => String::new(),
            },
        )
    }
}

impl ValuationResult {
    pub fn has_warning(&self, warning: &str) -> bool {
        self.warnings.iter().any(|w| w == warning)
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Per-request identity and deadline, threaded through fetch and emit.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub deadline: tokio::time::Instant,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(budget: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: tokio::time::Instant::now() + budget,
            received_at: Utc::now(),
        }
    }

    /// Same deadline under a fresh request id, for one item of a batch.
    pub fn child(&self) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: self.deadline,
            received_at: self.received_at,
        }
    }

    /// Same request id under a fresh deadline `budget` from now.
    pub fn with_budget(&self, budget: Duration) -> Self {
        Self {
            request_id: self.request_id,
            deadline: tokio::time::Instant::now() + budget,
            received_at: self.received_at,
        }
    }

    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The smaller of `timeout` and the time left on the deadline.
    pub fn bound(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Webhook delivery failures. Never fails the originating valuation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Event rejected before send: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Webhook circuit open")]
    CircuitOpen,

    #[error("Webhook rejected event with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_error: String,
    },

    #[error("Deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Domain error taxonomy surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum ValuationError {
    #[error("Invalid request: {}", .reasons.join("; "))]
    Validation { reasons: Vec<String> },

    #[error("Insufficient data: {}", .reasons.join("; "))]
    InsufficientData {
        reasons: Vec<String>,
        remediation: Option<String>,
    },

    #[error("Upstream {source_kind} unavailable: {message}")]
    UpstreamUnavailable {
        source_kind: SourceKind,
        message: String,
    },

    #[error("Circuit open for {source_kind}")]
    CircuitOpen { source_kind: SourceKind },

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl ValuationError {
    pub fn insufficient(reason: impl Into<String>) -> Self {
        ValuationError::InsufficientData {
            reasons: vec![reason.into()],
            remediation: None,
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ValuationError::Validation { .. } => 400,
            ValuationError::InsufficientData { .. } => 422,
            ValuationError::UpstreamUnavailable { .. } | ValuationError::CircuitOpen { .. } => 503,
            ValuationError::Delivery(_) => 502,
        }
    }

    /// Short machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ValuationError::Validation { .. } => "validation_error",
            ValuationError::InsufficientData { .. } => "insufficient_data",
            ValuationError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ValuationError::CircuitOpen { .. } => "upstream_unavailable",
            ValuationError::Delivery(_) => "delivery_error",
        }
    }

    /// Structured reasons for the response body.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            ValuationError::Validation { reasons }
            | ValuationError::InsufficientData { reasons, .. } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }

    pub fn remediation(&self) -> Option<&str> {
        match self {
            ValuationError::InsufficientData { remediation, .. } => remediation.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
