//! Outbound valuation event and its canonical encoding.
//!
//! Monetary amounts are carried as `Decimal` rounded to cents so the
//! encoded body, and therefore its hash, is stable for identical logical
//! content. Encoding sorts object keys recursively and emits compact JSON.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{
    Driver, MacroSnapshot, MarketFundamentals, Provenance, ProvenanceBlock, SubjectProperty,
    ValuationResult, METHOD_VERSION, MODEL_NAME,
};

pub const SCHEMA_VERSION: &str = "1.0";

/// Valid event value ranges.
pub const MAX_VACANCY_RATE: f64 = 0.4;
pub const MIN_EVENT_CAP_RATE: f64 = 2.0;
pub const MAX_EVENT_CAP_RATE: f64 = 20.0;

/// Confidence discount applied to the twelve-month horizon.
pub const FORECAST_CONFIDENCE_DISCOUNT: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "valuation.upsert")]
    Upsert,
    #[serde(rename = "valuation.insufficient")]
    Insufficient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    StaleData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            name: MODEL_NAME.to_string(),
            version: METHOD_VERSION.to_string(),
        }
    }
}

/// Per-source provenance. Insufficient-data events may lack some sources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventProvenance {
    #[serde(rename = "macro")]
    pub macro_data: Option<Provenance>,
    pub fundamentals: Option<Provenance>,
    pub comps: Option<Provenance>,
}

impl From<&ProvenanceBlock> for EventProvenance {
    fn from(block: &ProvenanceBlock) -> Self {
        Self {
            macro_data: Some(block.macro_data.clone()),
            fundamentals: Some(block.fundamentals.clone()),
            comps: Some(block.comps.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventInputs {
    pub building_sf: f64,
    pub noi_annual: Option<f64>,
    pub year_built: Option<i32>,
    pub submarket: Option<String>,
    pub vacancy_rate: Option<f64>,
    pub asking_rent_psf: Option<f64>,
    pub rent_growth_yoy: Option<f64>,
    pub market_cap_rate_avg: Option<f64>,
    pub fed_funds_rate: Option<f64>,
    pub treasury_10y: Option<f64>,
    pub comp_count: usize,
}

impl EventInputs {
    fn new(
        subject: &SubjectProperty,
        fundamentals: Option<&MarketFundamentals>,
        macro_snapshot: Option<&MacroSnapshot>,
    ) -> Self {
        Self {
            building_sf: subject.building_sf,
            noi_annual: subject.noi_annual,
            year_built: subject.year_built,
            submarket: subject.submarket.clone(),
            vacancy_rate: fundamentals.map(|f| f.vacancy_rate),
            asking_rent_psf: fundamentals.map(|f| f.asking_rent_psf),
            rent_growth_yoy: fundamentals.map(|f| f.rent_growth_yoy),
            market_cap_rate_avg: fundamentals.map(|f| f.cap_rate_avg),
            fed_funds_rate: macro_snapshot.map(|m| m.fed_funds_rate),
            treasury_10y: macro_snapshot.map(|m| m.treasury_10y),
            comp_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentValue {
    pub value: Decimal,
    pub low: Decimal,
    pub high: Decimal,
    pub cap_rate: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast12m {
    pub value: Decimal,
    pub noi: Decimal,
    pub cap_rate: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationEvent {
    pub schema_version: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: String,
    pub market_id: String,
    pub as_of: NaiveDate,
    pub model: ModelInfo,
    pub provenance: EventProvenance,
    pub inputs: EventInputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<CurrentValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_12m: Option<Forecast12m>,
    #[serde(default)]
    pub drivers: Vec<Driver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Round a dollar amount to cents.
pub fn money(amount: f64) -> Decimal {
    Decimal::from_f64(amount).unwrap_or_default().round_dp(2)
}

impl ValuationEvent {
    /// Build the upsert event for a finished valuation.
    pub fn upsert(
        tenant_id: &str,
        subject: &SubjectProperty,
        result: &ValuationResult,
        fundamentals: &MarketFundamentals,
        macro_snapshot: &MacroSnapshot,
    ) -> Self {
        let mut inputs = EventInputs::new(subject, Some(fundamentals), Some(macro_snapshot));
        inputs.noi_annual = Some(result.noi_annual);
        inputs.comp_count = result.comp_count;

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type: EventType::Upsert,
            tenant_id: tenant_id.to_string(),
            market_id: result.market_id.clone(),
            as_of: result.valuation_date,
            model: ModelInfo::default(),
            provenance: EventProvenance::from(&result.provenance),
            inputs,
            current_value: Some(CurrentValue {
                value: money(result.point),
                low: money(result.low),
                high: money(result.high),
                cap_rate: result.cap_rate_applied,
                confidence: result.confidence,
            }),
            forecast_12m: Some(Forecast12m {
                value: money(result.forecast.value),
                noi: money(result.forecast.noi),
                cap_rate: result.forecast.cap_rate,
                confidence: (result.confidence - FORECAST_CONFIDENCE_DISCOUNT).max(0.0),
            }),
            drivers: result.forecast.drivers.clone(),
            status: None,
            warning: (!result.warnings.is_empty()).then(|| result.warnings.join(",")),
            reasons: Vec::new(),
        }
    }

    /// Build the event reporting that no valuation could be produced.
    pub fn insufficient(
        tenant_id: &str,
        subject: &SubjectProperty,
        provenance: EventProvenance,
        fundamentals: Option<&MarketFundamentals>,
        macro_snapshot: Option<&MacroSnapshot>,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type: EventType::Insufficient,
            tenant_id: tenant_id.to_string(),
            market_id: subject.market_id.clone(),
            as_of: subject.valuation_date,
            model: ModelInfo::default(),
            provenance,
            inputs: EventInputs::new(subject, fundamentals, macro_snapshot),
            current_value: None,
            forecast_12m: None,
            drivers: Vec::new(),
            status: None,
            warning: None,
            reasons,
        }
    }

    /// Structural and range checks run before anything is sent.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.schema_version.is_empty() {
            problems.push("schema_version is required".to_string());
        }
        if self.tenant_id.trim().is_empty() {
            problems.push("tenant_id is required".to_string());
        }
        if self.market_id.trim().is_empty() {
            problems.push("market_id is required".to_string());
        }
        if let Some(v) = self.inputs.vacancy_rate {
            if !(0.0..=MAX_VACANCY_RATE).contains(&v) {
                problems.push(format!("vacancy_rate {v} outside [0, {MAX_VACANCY_RATE}]"));
            }
        }

        match self.event_type {
            EventType::Upsert => {
                let p = &self.provenance;
                if p.macro_data.is_none() || p.fundamentals.is_none() || p.comps.is_none() {
                    problems.push("provenance must cover macro, fundamentals and comps".to_string());
                }
                match &self.current_value {
                    Some(cv) => {
                        check_cap_rate("current_value.cap_rate", cv.cap_rate, &mut problems);
                        check_confidence("current_value.confidence", cv.confidence, &mut problems);
                        if cv.value <= Decimal::ZERO {
                            problems.push("current_value.value must be positive".to_string());
                        }
                        if !(cv.low <= cv.value && cv.value <= cv.high) {
                            problems.push("current_value must satisfy low <= value <= high".to_string());
                        }
                    }
                    None => problems.push("current_value is required".to_string()),
                }
                match &self.forecast_12m {
                    Some(fc) => {
                        check_cap_rate("forecast_12m.cap_rate", fc.cap_rate, &mut problems);
                        check_confidence("forecast_12m.confidence", fc.confidence, &mut problems);
                    }
                    None => problems.push("forecast_12m is required".to_string()),
                }
            }
            EventType::Insufficient => {
                if self.reasons.is_empty() {
                    problems.push("insufficient event requires at least one reason".to_string());
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Canonical body bytes: recursively key-sorted compact JSON.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let raw = serde_json::to_value(self).context("serialize valuation event failed")?;
        let sorted = sort_keys(&raw);
        serde_json::to_vec(&sorted).context("json stringify failed")
    }
}

fn check_cap_rate(field: &str, cap: f64, problems: &mut Vec<String>) {
    if !(MIN_EVENT_CAP_RATE..=MAX_EVENT_CAP_RATE).contains(&cap) {
        problems.push(format!(
            "{field} {cap} outside [{MIN_EVENT_CAP_RATE}, {MAX_EVENT_CAP_RATE}]"
        ));
    }
}

fn check_confidence(field: &str, confidence: f64, problems: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&confidence) {
        problems.push(format!("{field} {confidence} outside [0, 1]"));
    }
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Lowercase hex SHA-256 of the body.
pub fn payload_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{FallbackReason, ForecastResult};
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn provenance(as_of: NaiveDate) -> Provenance {
        Provenance {
            source: "test".into(),
            as_of,
            from_cache: false,
        }
    }

    pub(crate) fn sample_fundamentals() -> MarketFundamentals {
        MarketFundamentals {
            market_id: "dfw".into(),
            vacancy_rate: 0.12,
            asking_rent_psf: 32.0,
            rent_growth_yoy: 0.03,
            cap_rate_avg: 6.1,
            as_of_date: d(2026, 6, 1),
            vacancy_rate_prior: None,
            net_absorption_sf: None,
            deliveries_sf: None,
        }
    }

    pub(crate) fn sample_macro() -> MacroSnapshot {
        MacroSnapshot {
            fed_funds_rate: 4.33,
            treasury_10y: 4.40,
            as_of_date: d(2026, 6, 29),
            source: "fred".into(),
            fed_funds_prior: None,
            treasury_10y_prior: None,
        }
    }

    pub(crate) fn sample_result(valuation_date: NaiveDate) -> ValuationResult {
        ValuationResult {
            market_id: "dfw".into(),
            valuation_date,
            point: 25_000_000.004,
            low: 22_500_000.0,
            high: 27_500_000.0,
            cap_rate_applied: 6.0,
            confidence: 0.9,
            half_width_pct: 0.10,
            method_version: METHOD_VERSION.into(),
            comp_count: 12,
            dispersion_bps: 40.0,
            fallback_reason: None::<FallbackReason>,
            warnings: vec![],
            noi_annual: 1_500_000.0,
            income_value: 25_000_000.0,
            sales_comparison_value: Some(25_000_000.0),
            disagreement_pct: Some(0.0),
            forecast: ForecastResult {
                noi: 1_545_000.0,
                cap_rate: 6.2,
                value: 24_919_354.84,
                clamped: false,
                drivers: vec![],
            },
            provenance: ProvenanceBlock {
                macro_data: provenance(valuation_date),
                fundamentals: provenance(valuation_date),
                comps: provenance(valuation_date),
            },
        }
    }

    pub(crate) fn sample_event(valuation_date: NaiveDate) -> ValuationEvent {
        let mut subject = SubjectProperty::sample();
        subject.valuation_date = valuation_date;
        ValuationEvent::upsert(
            "acme",
            &subject,
            &sample_result(valuation_date),
            &sample_fundamentals(),
            &sample_macro(),
        )
    }

    #[test]
    fn test_upsert_event_shape() {
        let ev = sample_event(d(2026, 6, 30));
        let json: Value = serde_json::from_slice(&ev.canonical_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "valuation.upsert");
        assert_eq!(json["schema_version"], SCHEMA_VERSION);
        assert_eq!(json["model"]["version"], METHOD_VERSION);
        assert!(json["provenance"]["macro"].is_object());
        assert!(json.get("status").is_none());
        assert_eq!(ev.current_value.as_ref().unwrap().value, dec!(25000000.00));
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn test_hash_stable_for_same_content() {
        let a = sample_event(d(2026, 6, 30));
        let b = sample_event(d(2026, 6, 30));
        assert_eq!(
            payload_hash(&a.canonical_bytes().unwrap()),
            payload_hash(&b.canonical_bytes().unwrap())
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = sample_event(d(2026, 6, 30));
        let mut b = a.clone();
        b.tenant_id = "acmf".into();
        let ha = payload_hash(&a.canonical_bytes().unwrap());
        let hb = payload_hash(&b.canonical_bytes().unwrap());
        assert_ne!(ha, hb);
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn test_canonical_keys_sorted() {
        let body = String::from_utf8(sample_event(d(2026, 6, 30)).canonical_bytes().unwrap()).unwrap();
        let as_of = body.find("\"as_of\"").unwrap();
        let tenant = body.find("\"tenant_id\"").unwrap();
        let current = body.find("\"current_value\"").unwrap();
        assert!(as_of < current && current < tenant);
        assert!(!body.contains('\n'));
    }

    #[test]
    fn test_validation_catches_ranges() {
        let mut ev = sample_event(d(2026, 6, 30));
        ev.inputs.vacancy_rate = Some(0.55);
        if let Some(cv) = ev.current_value.as_mut() {
            cv.cap_rate = 25.0;
            cv.confidence = 1.2;
        }
        let problems = ev.validate().unwrap_err();
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_insufficient_event_requires_reason() {
        let subject = SubjectProperty::sample();
        let ev = ValuationEvent::insufficient("acme", &subject, EventProvenance::default(), None, None, vec![]);
        assert!(ev.validate().is_err());
        let ev = ValuationEvent::insufficient(
            "acme",
            &subject,
            EventProvenance::default(),
            None,
            None,
            vec!["no market fundamentals".into()],
        );
        assert!(ev.validate().is_ok());
        let json: Value = serde_json::from_slice(&ev.canonical_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "valuation.insufficient");
        assert!(json.get("current_value").is_none());
    }
}
