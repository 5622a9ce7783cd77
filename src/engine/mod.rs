//! Core engine: resilient fetching and request orchestration.

pub mod breaker;
pub mod cache;
pub mod fetcher;
pub mod freshness;
pub mod orchestrator;
