//! APPRAISER: Commercial property valuation engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod backtest;
pub mod config;
pub mod data;
pub mod emitter;
pub mod engine;
pub mod storage;
pub mod types;
pub mod valuation;
