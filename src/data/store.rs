//! SQLite-backed market store.
//!
//! Reads market fundamentals and comparable sales with plain
//! `sqlx::query` + binds. Every row is decoded into a typed record and
//! validated at the boundary. Malformed rows are skipped and logged so
//! one bad record cannot take out a whole market: the newest valid
//! fundamentals row is served, and sales that fail checks are dropped.
//!
//! ```text
//! market_fundamentals(market_id, as_of_date, vacancy_rate, asking_rent_psf,
//!     rent_growth_yoy, cap_rate_avg, vacancy_rate_prior, net_absorption_sf,
//!     deliveries_sf)
//! comparable_sales(id, market_id, submarket, sale_date, building_sf,
//!     price_per_sf, cap_rate_pct, year_built, verification_status,
//!     latitude, longitude)
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, warn};

use super::MarketStore;
use crate::types::{ComparableSale, GeoPoint, MarketFundamentals, VerificationStatus};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fundamentals rows examined, newest first, before giving up on a market.
const FUNDAMENTALS_LOOKBACK_ROWS: i64 = 4;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid market store URL {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to market store {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the two tables if absent. Intended for local runs and tests;
    /// production schemas are owned by the ingestion pipeline.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_fundamentals (
                market_id         TEXT NOT NULL,
                as_of_date        TEXT NOT NULL,
                vacancy_rate      REAL NOT NULL,
                asking_rent_psf   REAL NOT NULL,
                rent_growth_yoy   REAL NOT NULL,
                cap_rate_avg      REAL NOT NULL,
                vacancy_rate_prior REAL,
                net_absorption_sf REAL,
                deliveries_sf     REAL,
                PRIMARY KEY (market_id, as_of_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create market_fundamentals failed")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comparable_sales (
                id                  TEXT PRIMARY KEY,
                market_id           TEXT NOT NULL,
                submarket           TEXT NOT NULL DEFAULT '',
                sale_date           TEXT NOT NULL,
                building_sf         REAL NOT NULL,
                price_per_sf        REAL NOT NULL,
                cap_rate_pct        REAL NOT NULL,
                year_built          INTEGER,
                verification_status TEXT NOT NULL,
                latitude            REAL,
                longitude           REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create comparable_sales failed")?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_comps_market_date
               ON comparable_sales (market_id, sale_date)"#,
        )
        .execute(&self.pool)
        .await
        .context("create comparable_sales index failed")?;

        Ok(())
    }

    pub async fn insert_fundamentals(&self, f: &MarketFundamentals) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO market_fundamentals
              (market_id, as_of_date, vacancy_rate, asking_rent_psf, rent_growth_yoy,
               cap_rate_avg, vacancy_rate_prior, net_absorption_sf, deliveries_sf)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&f.market_id)
        .bind(f.as_of_date.format(DATE_FORMAT).to_string())
        .bind(f.vacancy_rate)
        .bind(f.asking_rent_psf)
        .bind(f.rent_growth_yoy)
        .bind(f.cap_rate_avg)
        .bind(f.vacancy_rate_prior)
        .bind(f.net_absorption_sf)
        .bind(f.deliveries_sf)
        .execute(&self.pool)
        .await
        .context("insert market_fundamentals failed")?;
        Ok(())
    }

    pub async fn insert_comp(&self, c: &ComparableSale) -> Result<()> {
        let status = match c.verification_status {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Pending => "pending",
            VerificationStatus::Unverified => "unverified",
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO comparable_sales
              (id, market_id, submarket, sale_date, building_sf, price_per_sf,
               cap_rate_pct, year_built, verification_status, latitude, longitude)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&c.id)
        .bind(&c.market_id)
        .bind(&c.submarket)
        .bind(c.sale_date.format(DATE_FORMAT).to_string())
        .bind(c.building_sf)
        .bind(c.price_per_sf)
        .bind(c.cap_rate_pct)
        .bind(c.year_built.map(i64::from))
        .bind(status)
        .bind(c.location.map(|p| p.lat))
        .bind(c.location.map(|p| p.lon))
        .execute(&self.pool)
        .await
        .context("insert comparable_sales failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn parse_date(raw: &str, column: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .with_context(|| format!("{column}: invalid date '{raw}'"))
}

fn decode_fundamentals(r: &SqliteRow) -> Result<MarketFundamentals> {
    let as_of_raw: String = r.try_get("as_of_date").context("as_of_date")?;
    let f = MarketFundamentals {
        market_id: r.try_get("market_id").context("market_id")?,
        vacancy_rate: r.try_get("vacancy_rate").context("vacancy_rate")?,
        asking_rent_psf: r.try_get("asking_rent_psf").context("asking_rent_psf")?,
        rent_growth_yoy: r.try_get("rent_growth_yoy").context("rent_growth_yoy")?,
        cap_rate_avg: r.try_get("cap_rate_avg").context("cap_rate_avg")?,
        as_of_date: parse_date(&as_of_raw, "as_of_date")?,
        vacancy_rate_prior: r.try_get("vacancy_rate_prior").context("vacancy_rate_prior")?,
        net_absorption_sf: r.try_get("net_absorption_sf").context("net_absorption_sf")?,
        deliveries_sf: r.try_get("deliveries_sf").context("deliveries_sf")?,
    };

    if !(0.0..=1.0).contains(&f.vacancy_rate) {
        bail!("vacancy_rate {} outside [0, 1]", f.vacancy_rate);
    }
    if let Some(prior) = f.vacancy_rate_prior {
        if !(0.0..=1.0).contains(&prior) {
            bail!("vacancy_rate_prior {prior} outside [0, 1]");
        }
    }
    if !(f.asking_rent_psf.is_finite() && f.asking_rent_psf > 0.0) {
        bail!("asking_rent_psf must be positive, got {}", f.asking_rent_psf);
    }
    if !(f.cap_rate_avg > 0.0 && f.cap_rate_avg <= 30.0) {
        bail!("cap_rate_avg {} outside (0, 30]", f.cap_rate_avg);
    }
    if !f.rent_growth_yoy.is_finite() || f.rent_growth_yoy.abs() > 1.0 {
        bail!("rent_growth_yoy {} outside [-1, 1]", f.rent_growth_yoy);
    }
    Ok(f)
}

fn decode_comp(r: &SqliteRow) -> Result<ComparableSale> {
    let sale_date_raw: String = r.try_get("sale_date").context("sale_date")?;
    let status_raw: String = r.try_get("verification_status").context("verification_status")?;
    let year_built: Option<i64> = r.try_get("year_built").context("year_built")?;
    let latitude: Option<f64> = r.try_get("latitude").context("latitude")?;
    let longitude: Option<f64> = r.try_get("longitude").context("longitude")?;

    let comp = ComparableSale {
        id: r.try_get("id").context("id")?,
        market_id: r.try_get("market_id").context("market_id")?,
        submarket: r.try_get("submarket").context("submarket")?,
        sale_date: parse_date(&sale_date_raw, "sale_date")?,
        building_sf: r.try_get("building_sf").context("building_sf")?,
        price_per_sf: r.try_get("price_per_sf").context("price_per_sf")?,
        cap_rate_pct: r.try_get("cap_rate_pct").context("cap_rate_pct")?,
        year_built: year_built
            .map(i32::try_from)
            .transpose()
            .context("year_built out of range")?,
        verification_status: status_raw.parse()?,
        location: match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        },
    };
    comp.validate().map_err(anyhow::Error::msg)?;
    Ok(comp)
}

#[async_trait]
impl MarketStore for SqliteStore {
    fn name(&self) -> &'static str {
        "market_store"
    }

    async fn fundamentals(&self, market_id: &str) -> Result<Option<MarketFundamentals>> {
        let rows = sqlx::query(
            r#"
            SELECT market_id, as_of_date, vacancy_rate, asking_rent_psf, rent_growth_yoy,
                   cap_rate_avg, vacancy_rate_prior, net_absorption_sf, deliveries_sf
            FROM market_fundamentals
            WHERE market_id = ?1
            ORDER BY as_of_date DESC
            LIMIT ?2
            "#,
        )
        .bind(market_id)
        .bind(FUNDAMENTALS_LOOKBACK_ROWS)
        .fetch_all(&self.pool)
        .await
        .context("fundamentals query failed")?;

        for r in &rows {
            match decode_fundamentals(r) {
                Ok(f) => return Ok(Some(f)),
                Err(e) => {
                    warn!(market = market_id, error = %e, "Skipping invalid fundamentals row");
                }
            }
        }
        if !rows.is_empty() {
            warn!(market = market_id, rows = rows.len(), "No valid fundamentals row");
        }
        Ok(None)
    }

    async fn comps(&self, market_id: &str, limit: u32) -> Result<Vec<ComparableSale>> {
        let rows = sqlx::query(
            r#"
            SELECT id, market_id, submarket, sale_date, building_sf, price_per_sf,
                   cap_rate_pct, year_built, verification_status, latitude, longitude
            FROM comparable_sales
            WHERE market_id = ?1
            ORDER BY sale_date DESC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(market_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("comparable_sales query failed")?;

        let mut comps = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for r in &rows {
            match decode_comp(r) {
                Ok(c) => comps.push(c),
                Err(e) => {
                    skipped += 1;
                    warn!(market = market_id, error = %e, "Skipping invalid comparable sale row");
                }
            }
        }
        debug!(market = market_id, rows = rows.len(), kept = comps.len(), skipped, "Comps loaded");
        Ok(comps)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
