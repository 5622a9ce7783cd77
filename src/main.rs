//! APPRAISER: Commercial property valuation service
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the fetch layer, estimator and emitter together, serves the HTTP
//! API and runs periodic cache maintenance until shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use appraiser::api;
use appraiser::backtest::ConformalCalibrator;
use appraiser::config::AppConfig;
use appraiser::data::fred::FredClient;
use appraiser::data::store::SqliteStore;
use appraiser::emitter::{Emitter, EmitterConfig, HttpTransport};
use appraiser::engine::fetcher::ResilientFetcher;
use appraiser::engine::orchestrator::{Orchestrator, OrchestratorSettings};
use appraiser::storage;
use appraiser::valuation::Estimator;

const BANNER: &str = r#"
    _    ____  ____  ____      _    ___ ____  _____ ____
   / \  |  _ \|  _ \|  _ \    / \  |_ _/ ___|| ____|  _ \
  / _ \ | |_) | |_) | |_) |  / _ \  | |\___ \|  _| | |_) |
 / ___ \|  __/|  __/|  _ <  / ___ \ | | ___) | |___|  _ <
/_/   \_\_|   |_|   |_| \_\/_/   \_\___|____/|_____|_| \_\

  Income-approach valuation with signed result delivery
  v0.1.0
"#;

/// How often stale cache entries are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Cache entries older than this are dropped by the sweep.
const CACHE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("APPRAISER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();
    cfg.validate()?;

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        tenant = %cfg.service.tenant_id,
        markets = ?cfg.service.known_markets,
        port = cfg.service.port,
        "APPRAISER starting up"
    );

    // -- Initialise components -------------------------------------------

    let webhook_secret = cfg.webhook_secret()?;
    let fred_key = AppConfig::resolve_env(&cfg.sources.macro_source.api_key_env)?;
    let fred = FredClient::new(
        fred_key,
        Duration::from_secs(cfg.sources.macro_source.timeout_secs),
    )?;

    let store = SqliteStore::connect(&cfg.sources.store.database_url).await?;
    store.ensure_schema().await?;

    let fetcher = Arc::new(ResilientFetcher::new(
        Arc::new(fred),
        Arc::new(store),
        cfg.fetch_settings(),
    ));

    let mut calibrator =
        ConformalCalibrator::new(cfg.estimator.target_coverage, cfg.estimator.backtest_window);
    if let Some(path) = &cfg.service.backtest_path {
        match storage::load_backtest(path) {
            Ok(Some(observations)) => calibrator.add_observations(observations),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Backtest unreadable, using default interval width"),
        }
    }
    let calibration = calibrator.calibration();
    info!(
        half_width = calibration.half_width,
        sample_size = calibration.sample_size,
        is_default = calibration.is_default,
        skipped = calibrator.skipped(),
        "Interval calibration ready"
    );
    let estimator = Arc::new(Estimator::new(cfg.estimator_config(), calibration));

    let transport = HttpTransport::new().context("Failed to initialise webhook transport")?;
    let emitter = Arc::new(Emitter::new(
        EmitterConfig::from_app(&cfg, webhook_secret),
        Arc::new(transport),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        fetcher.clone(),
        estimator,
        emitter,
        OrchestratorSettings::from_app(&cfg),
    ));

    // -- Serve -------------------------------------------------------------

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(orchestrator.clone(), cfg.service.port, async move {
        let _ = stop_rx.await;
    }));

    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Serving. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = fetcher.evict_older_than(CACHE_RETENTION).await;
                let stats = fetcher.stats();
                info!(
                    evicted,
                    cache_hit_rate = format!("{:.1}%", stats.cache_hit_rate() * 100.0),
                    "Cache maintenance"
                );
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server stopped with error"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    let stats = orchestrator.stats();
    info!(
        valuations = stats.valuations,
        insufficient = stats.insufficient,
        failures = stats.failures,
        delivered = stats.events_delivered,
        delivery_failures = stats.delivery_failures,
        "APPRAISER shut down cleanly."
    );

    Ok(())
}

/// Initialise the tracing subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("appraiser=info"));

    let json_logging = std::env::var("APPRAISER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
