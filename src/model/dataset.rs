//! Assembly of design matrices from engineered features.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;

use crate::domain::{FeatureRecord, Observation};

/// Column order of every design row handed to the regression capability.
/// The auxiliary fuel price is encoded as a (value, presence) pair so a
/// missing series stays distinguishable from a zero price.
pub const FEATURE_NAMES: &[&str] = &[
    "price_lag_1h",
    "price_lag_24h",
    "rolling_mean_24h",
    "volatility_24h",
    "momentum_3h",
    "demand_mw",
    "hour_sin",
    "hour_cos",
    "is_weekend",
    "fuel_price_lag_1d",
    "has_fuel_price",
];

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub timestamp: DateTime<Utc>,
    pub features: Vec<f64>,
    pub target: f64,
}

/// Cyclic hour-of-day encoding plus a weekend flag.
pub fn temporal_features(ts: DateTime<Utc>) -> (f64, f64, f64) {
    let hour = ts.hour() as f64;
    let angle = 2.0 * std::f64::consts::PI * hour / 24.0;
    let weekend = matches!(ts.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);
    (angle.sin(), angle.cos(), if weekend { 1.0 } else { 0.0 })
}

/// Build one design row from an engineered record and its observation.
/// Returns `None` when any feature the pipeline could not compute is still
/// missing; such rows are excluded from training and validation.
pub fn design_row(record: &FeatureRecord, demand_mw: Option<f64>) -> Option<Vec<f64>> {
    let (hour_sin, hour_cos, is_weekend) = temporal_features(record.timestamp);
    let (fuel, has_fuel) = match record.fuel_price_lag_1d {
        Some(v) => (v, 1.0),
        None => (0.0, 0.0),
    };
    Some(vec![
        record.price_lag_1h?,
        record.price_lag_24h?,
        record.rolling_mean_24h?,
        record.volatility_24h?,
        record.momentum_3h?,
        demand_mw?,
        hour_sin,
        hour_cos,
        is_weekend,
        fuel,
        has_fuel,
    ])
}

/// Join features with their observations into usable training rows, ordered
/// by timestamp. Rows missing a target price, flagged invalid, or lacking a
/// computable feature are dropped.
pub fn training_rows(
    observations: &[Observation],
    features: &[FeatureRecord],
) -> Vec<TrainingRow> {
    let by_ts: HashMap<DateTime<Utc>, &Observation> =
        observations.iter().map(|o| (o.timestamp, o)).collect();

    let mut rows: Vec<TrainingRow> = features
        .iter()
        .filter_map(|record| {
            let obs = by_ts.get(&record.timestamp)?;
            if !obs.is_valid {
                return None;
            }
            let target = obs.price?;
            let row = design_row(record, obs.demand_mw)?;
            Some(TrainingRow {
                timestamp: record.timestamp,
                features: row,
                target,
            })
        })
        .collect();
    rows.sort_by_key(|r| r.timestamp);
    rows
}
