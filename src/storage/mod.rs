//! Persistence layer.
//!
//! Appends finished valuations to a JSON-lines file and loads backtest
//! residual pairs for the conformal calibrator. Both are plain files; the
//! result sink is best effort and callers log rather than fail on error.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::backtest::BacktestObservation;
use crate::types::ValuationResult;

/// Append one result as a single JSON line.
pub async fn append_result(result: &ValuationResult, path: &str) -> Result<()> {
    let mut line = serde_json::to_string(result).context("Failed to serialise valuation result")?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context(format!("Failed to open results file {path}"))?;
    file.write_all(line.as_bytes())
        .await
        .context(format!("Failed to append result to {path}"))?;
    file.flush()
        .await
        .context(format!("Failed to flush results file {path}"))?;

    debug!(path, market = %result.market_id, value = result.point, "Result appended");
    Ok(())
}

/// Read every result back from a JSON-lines file. Unparseable lines are
/// skipped with a warning.
pub fn load_results(path: &str) -> Result<Vec<ValuationResult>> {
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }
    let contents =
        std::fs::read_to_string(path).context(format!("Failed to read results from {path}"))?;

    let mut results = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(r) => results.push(r),
            Err(e) => warn!(path, line = lineno + 1, error = %e, "Skipping malformed result line"),
        }
    }
    Ok(results)
}

/// Load backtest pairs from a JSON array of `{predicted, realized}`.
/// Returns None if the file doesn't exist.
pub fn load_backtest(path: &str) -> Result<Option<Vec<BacktestObservation>>> {
    if !Path::new(path).exists() {
        info!(path, "No backtest file found, using default interval width");
        return Ok(None);
    }

    let json =
        std::fs::read_to_string(path).context(format!("Failed to read backtest from {path}"))?;
    let observations: Vec<BacktestObservation> =
        serde_json::from_str(&json).context(format!("Failed to parse backtest from {path}"))?;

    info!(path, observations = observations.len(), "Backtest loaded from disk");
    Ok(Some(observations))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
