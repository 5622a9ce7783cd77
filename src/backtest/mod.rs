//! Backtest residuals and interval calibration.

pub mod calibration;

pub use calibration::{BacktestObservation, Calibration, ConformalCalibrator};
