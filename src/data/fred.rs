//! Macro rates from the FRED API (Federal Reserve Economic Data).
//!
//! API: `https://api.stlouisfed.org/fred/series/observations`
//! Auth: API key via `api_key` query param. Free registration.
//! Rate limit: 120 req/min.
//!
//! Series: DFF (effective fed funds rate), DGS10 (10-year Treasury
//! constant maturity). Both are daily, in percent. Holidays are reported
//! with the value `"."`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::MacroSource;
use crate::types::MacroSnapshot;

const FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred/series/observations";
const FED_FUNDS_SERIES: &str = "DFF";
const TREASURY_10Y_SERIES: &str = "DGS10";

/// Plausible range for either rate, in percent.
const MIN_RATE_PCT: f64 = -1.0;
const MAX_RATE_PCT: f64 = 25.0;

/// History requested per series: one year plus slack for the prior value.
const LOOKBACK_DAYS: i64 = 400;

// ---------------------------------------------------------------------------
// FRED API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FredResponse {
    #[serde(default)]
    observations: Vec<FredObservation>,
}

#[derive(Debug, Deserialize)]
struct FredObservation {
    date: String,
    value: String,
}

/// A parsed observation. Missing values are dropped during parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    date: NaiveDate,
    value: f64,
}

fn parse_observations(raw: &[FredObservation]) -> Vec<Point> {
    let mut points: Vec<Point> = raw
        .iter()
        .filter(|o| o.value != ".")
        .filter_map(|o| {
            let date = NaiveDate::parse_from_str(&o.date, "%Y-%m-%d").ok()?;
            let value = o.value.trim().parse::<f64>().ok()?;
            Some(Point { date, value })
        })
        .collect();
    points.sort_by_key(|p| p.date);
    points
}

/// Latest observation on or before `date`.
fn value_on_or_before(points: &[Point], date: NaiveDate) -> Option<Point> {
    points.iter().rev().find(|p| p.date <= date).copied()
}

fn check_range(series_id: &str, value: f64) -> Result<()> {
    if !(MIN_RATE_PCT..=MAX_RATE_PCT).contains(&value) {
        bail!("{series_id} value {value} outside plausible range [{MIN_RATE_PCT}, {MAX_RATE_PCT}]");
    }
    Ok(())
}

/// Combine the two series into one snapshot.
///
/// The snapshot is dated by the older of the two latest observations so
/// neither rate is reported as newer than it is.
fn build_snapshot(fed_funds: &[Point], treasury: &[Point]) -> Result<MacroSnapshot> {
    let ff_latest = fed_funds.last().copied().context("No DFF observations")?;
    let t10_latest = treasury.last().copied().context("No DGS10 observations")?;
    check_range(FED_FUNDS_SERIES, ff_latest.value)?;
    check_range(TREASURY_10Y_SERIES, t10_latest.value)?;

    let as_of_date = ff_latest.date.min(t10_latest.date);
    let year_ago = as_of_date - Duration::days(365);
    let prior = |points: &[Point]| {
        value_on_or_before(points, year_ago)
            .map(|p| p.value)
            .filter(|v| (MIN_RATE_PCT..=MAX_RATE_PCT).contains(v))
    };

    Ok(MacroSnapshot {
        fed_funds_rate: ff_latest.value,
        treasury_10y: t10_latest.value,
        as_of_date,
        source: "fred".to_string(),
        fed_funds_prior: prior(fed_funds),
        treasury_10y_prior: prior(treasury),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FredClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl FredClient {
    pub fn new(api_key: String, timeout: std::time::Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("APPRAISER/0.1.0")
            .build()
            .context("Failed to build FRED HTTP client")?;
        Ok(Self {
            http,
            api_key,
            base_url: FRED_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different host (for local mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn series_url(&self, series_id: &str, start: NaiveDate) -> String {
        format!(
            "{}?series_id={}&api_key={}&file_type=json&sort_order=asc&observation_start={}",
            self.base_url,
            urlencoding::encode(series_id),
            urlencoding::encode(&self.api_key),
            start.format("%Y-%m-%d"),
        )
    }

    async fn fetch_series(&self, series_id: &str, start: NaiveDate) -> Result<Vec<Point>> {
        let url = self.series_url(series_id, start);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("FRED request failed for {series_id}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            bail!("FRED API error for {series_id}: {status}");
        }

        let data: FredResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse FRED response for {series_id}"))?;

        let points = parse_observations(&data.observations);
        debug!(series = series_id, observations = points.len(), "FRED series fetched");
        Ok(points)
    }
}

#[async_trait]
impl MacroSource for FredClient {
    fn name(&self) -> &'static str {
        "fred"
    }

    async fn latest(&self) -> Result<MacroSnapshot> {
        let start = Utc::now().date_naive() - Duration::days(LOOKBACK_DAYS);
        let (fed_funds, treasury) = tokio::try_join!(
            self.fetch_series(FED_FUNDS_SERIES, start),
            self.fetch_series(TREASURY_10Y_SERIES, start),
        )?;
        build_snapshot(&fed_funds, &treasury)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
