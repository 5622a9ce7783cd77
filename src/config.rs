//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every field has a default matching the documented behaviour, so a
//! minimal file only needs the webhook endpoint. Secrets (the webhook
//! HMAC key, the FRED API key) are referenced by env-var name and
//! resolved at runtime.

use anyhow::{bail, Context, Result};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::emitter::signing::MIN_SECRET_LEN;
use crate::engine::breaker::CircuitBreakerConfig;
use crate::engine::fetcher::FetchSettings;
use crate::engine::freshness::FreshnessPolicy;
use crate::valuation::EstimatorConfig;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub estimator: EstimatorSettings,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub tenant_id: String,
    pub port: u16,
    pub known_markets: Vec<String>,
    /// Total time budget for one valuation request (fetch + emit).
    pub request_budget_secs: u64,
    pub results_path: Option<String>,
    pub backtest_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "APPRAISER-001".to_string(),
            tenant_id: "default".to_string(),
            port: 8080,
            known_markets: vec!["dfw".to_string()],
            request_budget_secs: 60,
            results_path: None,
            backtest_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SourcesConfig {
    #[serde(rename = "macro")]
    pub macro_source: MacroSourceConfig,
    pub store: StoreConfig,
    pub fundamentals: CacheRule,
    pub comps: CompsConfig,
}

/// Macro time-series API (FRED).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MacroSourceConfig {
    pub api_key_env: String,
    pub ttl_secs: u64,
    pub freshness_days: i64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub timeout_secs: u64,
}

impl Default for MacroSourceConfig {
    fn default() -> Self {
        Self {
            api_key_env: "FRED_API_KEY".to_string(),
            ttl_secs: 30 * 60,
            freshness_days: 7,
            failure_threshold: 3,
            cooldown_secs: 60,
            timeout_secs: 15,
        }
    }
}

/// Relational store holding fundamentals and comparable sales.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://appraiser.db".to_string(),
            failure_threshold: 5,
            cooldown_secs: 120,
            timeout_secs: 10,
        }
    }
}

/// Cache TTL and freshness threshold for one record type.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheRule {
    pub ttl_secs: u64,
    pub freshness_days: i64,
}

impl Default for CacheRule {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            freshness_days: 90,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompsConfig {
    pub ttl_secs: u64,
    pub freshness_days: i64,
    pub limit: u32,
}

impl Default for CompsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 6 * 60 * 60,
            freshness_days: 180,
            limit: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_webhook_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_webhook_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_secs: u64,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Time allowed for delivering one event, retries included. Starts
    /// when that event's delivery starts.
    #[serde(default = "default_delivery_budget")]
    pub delivery_budget_secs: u64,
}

fn default_secret_env() -> String {
    "APPRAISER_WEBHOOK_SECRET".to_string()
}
fn default_webhook_threshold() -> u32 {
    5
}
fn default_webhook_cooldown() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_retry_after() -> u64 {
    60
}
fn default_webhook_timeout() -> u64 {
    20
}
fn default_delivery_budget() -> u64 {
    120
}

/// Tunables for the degradation rules of the estimator.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EstimatorSettings {
    pub min_comps: usize,
    pub dispersion_threshold_bps: f64,
    pub dispersion_widen_bps: f64,
    pub stale_widen_bps: f64,
    pub target_coverage: f64,
    pub backtest_window: usize,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            min_comps: 8,
            dispersion_threshold_bps: 150.0,
            dispersion_widen_bps: 250.0,
            stale_widen_bps: 450.0,
            target_coverage: 0.80,
            backtest_window: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PortfolioConfig {
    pub concurrency: usize,
    pub emit_batch_size: usize,
    pub emit_pause_ms: u64,
    pub max_properties: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            emit_batch_size: 25,
            emit_pause_ms: 250,
            max_properties: 500,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Check structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        match reqwest::Url::parse(&self.webhook.url) {
            Ok(url) if url.scheme() == "https" => {}
            Ok(url) => problems.push(format!(
                "webhook.url must use https, got scheme '{}'",
                url.scheme()
            )),
            Err(e) => problems.push(format!("webhook.url is not a valid URL: {e}")),
        }

        if self.service.known_markets.is_empty() {
            problems.push("service.known_markets must not be empty".to_string());
        }
        if self.service.tenant_id.trim().is_empty() {
            problems.push("service.tenant_id must not be empty".to_string());
        }

        let thresholds = [
            ("sources.macro.failure_threshold", self.sources.macro_source.failure_threshold),
            ("sources.store.failure_threshold", self.sources.store.failure_threshold),
            ("webhook.failure_threshold", self.webhook.failure_threshold),
            ("webhook.max_attempts", self.webhook.max_attempts),
        ];
        for (name, value) in thresholds {
            if value == 0 {
                problems.push(format!("{name} must be > 0"));
            }
        }

        let durations = [
            ("sources.macro.cooldown_secs", self.sources.macro_source.cooldown_secs),
            ("sources.store.cooldown_secs", self.sources.store.cooldown_secs),
            ("webhook.cooldown_secs", self.webhook.cooldown_secs),
            ("sources.macro.timeout_secs", self.sources.macro_source.timeout_secs),
            ("sources.store.timeout_secs", self.sources.store.timeout_secs),
            ("webhook.timeout_secs", self.webhook.timeout_secs),
            ("webhook.delivery_budget_secs", self.webhook.delivery_budget_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                problems.push(format!("{name} must be > 0"));
            }
        }

        let freshness = [
            ("sources.macro.freshness_days", self.sources.macro_source.freshness_days),
            ("sources.fundamentals.freshness_days", self.sources.fundamentals.freshness_days),
            ("sources.comps.freshness_days", self.sources.comps.freshness_days),
        ];
        for (name, value) in freshness {
            if value <= 0 {
                problems.push(format!("{name} must be > 0"));
            }
        }

        if self.portfolio.concurrency == 0 {
            problems.push("portfolio.concurrency must be >= 1".to_string());
        }
        if self.portfolio.emit_batch_size == 0 {
            problems.push("portfolio.emit_batch_size must be >= 1".to_string());
        }
        if !(0.0 < self.estimator.target_coverage && self.estimator.target_coverage < 1.0) {
            problems.push("estimator.target_coverage must be in (0, 1)".to_string());
        }

        if !problems.is_empty() {
            bail!("Invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }

    /// Resolve and check the webhook signing secret.
    pub fn webhook_secret(&self) -> Result<Secret<String>> {
        let secret = Secret::new(Self::resolve_env(&self.webhook.secret_env)?);
        check_secret(&secret)?;
        Ok(secret)
    }

    // -- Derived settings -------------------------------------------------

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            macro_days: self.sources.macro_source.freshness_days,
            fundamentals_days: self.sources.fundamentals.freshness_days,
            comps_days: self.sources.comps.freshness_days,
        }
    }

    pub fn macro_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.sources.macro_source.failure_threshold,
            cooldown: Duration::from_secs(self.sources.macro_source.cooldown_secs),
        }
    }

    pub fn store_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.sources.store.failure_threshold,
            cooldown: Duration::from_secs(self.sources.store.cooldown_secs),
        }
    }

    pub fn webhook_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.webhook.failure_threshold,
            cooldown: Duration::from_secs(self.webhook.cooldown_secs),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        let src = &self.sources;
        FetchSettings {
            macro_ttl: Duration::from_secs(src.macro_source.ttl_secs),
            fundamentals_ttl: Duration::from_secs(src.fundamentals.ttl_secs),
            comps_ttl: Duration::from_secs(src.comps.ttl_secs),
            macro_timeout: Duration::from_secs(src.macro_source.timeout_secs),
            store_timeout: Duration::from_secs(src.store.timeout_secs),
            comps_limit: src.comps.limit,
            macro_breaker: self.macro_breaker(),
            store_breaker: self.store_breaker(),
            freshness: self.freshness_policy(),
        }
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        let est = &self.estimator;
        EstimatorConfig {
            min_comps: est.min_comps,
            dispersion_threshold_bps: est.dispersion_threshold_bps,
            dispersion_widen_bps: est.dispersion_widen_bps,
            stale_widen_bps: est.stale_widen_bps,
            ..EstimatorConfig::default()
        }
    }
}

/// Reject signing secrets shorter than the minimum length.
pub fn check_secret(secret: &Secret<String>) -> Result<()> {
    let len = secret.expose_secret().chars().count();
    if len < MIN_SECRET_LEN {
        bail!("webhook secret must be at least {MIN_SECRET_LEN} characters, got {len}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [webhook]
        url = "https://hooks.example.com/valuations"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.sources.macro_source.ttl_secs, 1800);
        assert_eq!(cfg.sources.macro_source.freshness_days, 7);
        assert_eq!(cfg.sources.fundamentals.ttl_secs, 86_400);
        assert_eq!(cfg.sources.fundamentals.freshness_days, 90);
        assert_eq!(cfg.sources.comps.freshness_days, 180);
        assert_eq!(cfg.webhook.max_attempts, 5);
        assert_eq!(cfg.webhook.base_backoff_ms, 500);
        assert_eq!(cfg.webhook.failure_threshold, 5);
        assert_eq!(cfg.webhook.cooldown_secs, 120);
        assert_eq!(cfg.webhook.delivery_budget_secs, 120);
        assert_eq!(cfg.portfolio.concurrency, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sections_override_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [service]
            tenant_id = "acme"
            known_markets = ["dfw", "atl", "phx"]

            [sources.macro]
            failure_threshold = 4
            cooldown_secs = 90

            [sources.comps]
            limit = 50

            [webhook]
            url = "https://hooks.example.com/v"
            cooldown_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.service.tenant_id, "acme");
        assert_eq!(cfg.service.known_markets.len(), 3);
        assert_eq!(cfg.macro_breaker().failure_threshold, 4);
        assert_eq!(cfg.macro_breaker().cooldown, Duration::from_secs(90));
        assert_eq!(cfg.store_breaker().failure_threshold, 5);
        assert_eq!(cfg.webhook_breaker().cooldown, Duration::from_secs(60));
        assert_eq!(cfg.sources.comps.limit, 50);
    }

    #[test]
    fn test_rejects_plain_http_endpoint() {
        let cfg = AppConfig::from_toml(
            r#"
            [webhook]
            url = "http://hooks.example.com/v"
            "#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("https"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let mut cfg = AppConfig::from_toml(MINIMAL).unwrap();
        cfg.webhook.failure_threshold = 0;
        cfg.portfolio.concurrency = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("webhook.failure_threshold"));
        assert!(err.contains("portfolio.concurrency"));
    }

    #[test]
    fn test_missing_webhook_section_fails() {
        assert!(AppConfig::from_toml("[service]\nport = 9000\n").is_err());
    }

    #[test]
    fn test_secret_length_check() {
        assert!(check_secret(&Secret::new("short".to_string())).is_err());
        assert!(check_secret(&Secret::new("0123456789abcdef".to_string())).is_ok());
    }

    #[test]
    fn test_freshness_policy_from_config() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        let policy = cfg.freshness_policy();
        assert_eq!(policy.macro_days, 7);
        assert_eq!(policy.fundamentals_days, 90);
        assert_eq!(policy.comps_days, 180);
    }

    #[test]
    fn test_derived_fetch_and_estimator_settings() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        let fetch = cfg.fetch_settings();
        assert_eq!(fetch.macro_ttl, Duration::from_secs(1800));
        assert_eq!(fetch.store_timeout, Duration::from_secs(10));
        assert_eq!(fetch.comps_limit, 200);
        assert_eq!(fetch.macro_breaker.failure_threshold, 3);

        let est = cfg.estimator_config();
        assert_eq!(est.min_comps, 8);
        assert_eq!(est.stale_widen_bps, 450.0);
    }
}
