//! Upstream data adapters.
//!
//! Defines the source traits the fetch layer depends on, with a FRED
//! client for macro rates and a SQLite store for market fundamentals and
//! comparable sales.

pub mod fred;
pub mod store;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ComparableSale, MacroSnapshot, MarketFundamentals};

/// Source of the latest macro rates snapshot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MacroSource: Send + Sync {
    /// Human-readable source name used in provenance.
    fn name(&self) -> &'static str;

    async fn latest(&self) -> Result<MacroSnapshot>;
}

/// Source of market fundamentals and recorded sales.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Most recent fundamentals row for the market, if any.
    async fn fundamentals(&self, market_id: &str) -> Result<Option<MarketFundamentals>>;

    /// Up to `limit` sales in the market, newest first.
    async fn comps(&self, market_id: &str, limit: u32) -> Result<Vec<ComparableSale>>;
}
