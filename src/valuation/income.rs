//! Income approach: NOI derivation, direct capitalization and the
//! twelve-month forecast.

use serde::{Deserialize, Serialize};

use super::filter::{MAX_CAP_RATE_PCT, MIN_CAP_RATE_PCT};
use crate::types::{
    Driver, ForecastResult, MacroSnapshot, MarketFundamentals, SubjectProperty, ValuationError,
};

/// Forecast cap-rate sensitivities and the clamp on total movement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastCoefficients {
    /// Per percentage point of 12-month change in the 10y − fed funds spread.
    pub alpha: f64,
    /// Per percentage point of 12-month change in vacancy.
    pub beta: f64,
    /// Per unit of absorption ratio (net absorption / deliveries).
    pub gamma: f64,
    /// Largest allowed cap-rate change, in percentage points.
    pub max_change_pct: f64,
}

impl Default for ForecastCoefficients {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            beta: 0.2,
            gamma: 0.1,
            max_change_pct: 1.5,
        }
    }
}

/// NOI as supplied, or built from rent, expenses and market vacancy.
pub fn derive_noi(
    subject: &SubjectProperty,
    fundamentals: &MarketFundamentals,
) -> Result<f64, ValuationError> {
    if let Some(noi) = subject.noi_annual {
        return Ok(noi);
    }
    let rent = subject.rent_psf.unwrap_or(fundamentals.asking_rent_psf);
    let opex = subject.opex_psf.ok_or_else(|| {
        ValuationError::insufficient("noi_annual or opex_psf is required to derive NOI")
    })?;
    let noi = (rent - opex) * subject.building_sf * (1.0 - fundamentals.vacancy_rate);
    if !(noi.is_finite() && noi > 0.0) {
        return Err(ValuationError::insufficient(format!(
            "derived NOI is not positive (rent {rent:.2}/sf, opex {opex:.2}/sf, vacancy {:.1}%)",
            fundamentals.vacancy_rate * 100.0
        )));
    }
    Ok(noi)
}

/// Direct capitalization: value = NOI / cap rate.
pub fn capitalize(noi: f64, cap_rate_pct: f64) -> Result<f64, ValuationError> {
    if !(cap_rate_pct.is_finite() && cap_rate_pct > 0.0) {
        return Err(ValuationError::insufficient(format!(
            "cap rate {cap_rate_pct:.3}% cannot capitalize income"
        )));
    }
    let value = noi / (cap_rate_pct / 100.0);
    if !(value.is_finite() && value > 0.0) {
        return Err(ValuationError::insufficient(format!(
            "capitalized value {value:.0} is not positive"
        )));
    }
    Ok(value)
}

/// Project NOI and cap rate twelve months forward.
///
/// Missing driver inputs contribute nothing.
pub fn forecast(
    noi: f64,
    cap_rate_now: f64,
    fundamentals: &MarketFundamentals,
    macro_snapshot: &MacroSnapshot,
    coefficients: &ForecastCoefficients,
) -> Result<ForecastResult, ValuationError> {
    let spread_change = macro_snapshot.term_spread_change().unwrap_or(0.0);
    let vacancy_change = fundamentals.vacancy_change_pts().unwrap_or(0.0);
    let absorption = fundamentals.absorption_ratio().unwrap_or(0.0);

    let spread_term = coefficients.alpha * spread_change;
    let vacancy_term = coefficients.beta * vacancy_change;
    let absorption_term = -coefficients.gamma * absorption;
    let raw_change = spread_term + vacancy_term + absorption_term;
    let change = raw_change.clamp(-coefficients.max_change_pct, coefficients.max_change_pct);

    let unbounded = cap_rate_now + change;
    let cap_rate = unbounded.clamp(MIN_CAP_RATE_PCT, MAX_CAP_RATE_PCT);
    let noi_future = noi * (1.0 + fundamentals.rent_growth_yoy);

    Ok(ForecastResult {
        noi: noi_future,
        cap_rate,
        value: capitalize(noi_future, cap_rate)?,
        clamped: change != raw_change || cap_rate != unbounded,
        drivers: vec![
            Driver {
                name: "macro_spread_change".to_string(),
                input: spread_change,
                contribution_bps: spread_term * 100.0,
            },
            Driver {
                name: "vacancy_change".to_string(),
                input: vacancy_change,
                contribution_bps: vacancy_term * 100.0,
            },
            Driver {
                name: "absorption_ratio".to_string(),
                input: absorption,
                contribution_bps: absorption_term * 100.0,
            },
            Driver {
                name: "rent_growth_yoy".to_string(),
                input: fundamentals.rent_growth_yoy,
                contribution_bps: 0.0,
            },
        ],
    })
}
