//! Dual-engine reconciliation.
//!
//! Compares the income value with a sales-comparison value (median price
//! per square foot of the comps, times subject size). When the two
//! disagree by more than 15% the reported value is a 60/40 blend in
//! favour of income.

use serde::Serialize;

use super::aggregate::median;
use crate::types::ComparableSale;

pub const DISAGREEMENT_THRESHOLD: f64 = 0.15;
pub const INCOME_WEIGHT: f64 = 0.6;
pub const SALES_WEIGHT: f64 = 0.4;

pub const WARN_ENGINE_DISAGREEMENT: &str = "engine_disagreement";
pub const WARN_NO_SALES_COMPARISON: &str = "no_sales_comparison";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub value: f64,
    pub income_value: f64,
    pub sales_comparison_value: Option<f64>,
    /// |income − sales| / min(income, sales).
    pub disagreement_pct: Option<f64>,
    pub warning: Option<&'static str>,
}

/// Sales-comparison value, or `None` with no usable comps.
pub fn sales_comparison_value(comps: &[ComparableSale], subject_sf: f64) -> Option<f64> {
    let prices: Vec<f64> = comps
        .iter()
        .map(|c| c.price_per_sf)
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect();
    median(&prices).map(|ppsf| ppsf * subject_sf)
}

pub fn reconcile(income_value: f64, comps: &[ComparableSale], subject_sf: f64) -> Reconciliation {
    let Some(sales_value) = sales_comparison_value(comps, subject_sf) else {
        return Reconciliation {
            value: income_value,
            income_value,
            sales_comparison_value: None,
            disagreement_pct: None,
            warning: Some(WARN_NO_SALES_COMPARISON),
        };
    };

    let disagreement = (income_value - sales_value).abs() / income_value.min(sales_value);
    if disagreement > DISAGREEMENT_THRESHOLD {
        Reconciliation {
            value: INCOME_WEIGHT * income_value + SALES_WEIGHT * sales_value,
            income_value,
            sales_comparison_value: Some(sales_value),
            disagreement_pct: Some(disagreement),
            warning: Some(WARN_ENGINE_DISAGREEMENT),
        }
    } else {
        Reconciliation {
            value: income_value,
            income_value,
            sales_comparison_value: Some(sales_value),
            disagreement_pct: Some(disagreement),
            warning: None,
        }
    }
}
