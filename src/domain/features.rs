use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engineered features derived 1:1 from an [`super::Observation`], keyed by
/// its timestamp so recomputation upserts rather than duplicates.
///
/// Every field is `Option`: `None` means the feature could not be computed
/// for that hour (series start, missing source data), which downstream
/// consumers must treat differently from a legitimate zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub timestamp: DateTime<Utc>,
    pub price_lag_1h: Option<f64>,
    pub price_lag_24h: Option<f64>,
    pub rolling_mean_1h: Option<f64>,
    pub rolling_mean_24h: Option<f64>,
    /// Sample standard deviation of price over the trailing window.
    pub volatility_1h: Option<f64>,
    pub volatility_24h: Option<f64>,
    /// Percentage change against the price N hours back.
    pub momentum_3h: Option<f64>,
    pub momentum_24h: Option<f64>,
    pub fuel_price_lag_1d: Option<f64>,
    pub fuel_price_lag_7d: Option<f64>,
    pub fuel_price_lag_30d: Option<f64>,
    /// Renewable output assumed curtailed when the price clears at or below
    /// the floor. Derived, not metered.
    pub curtailment_estimate_mw: Option<f64>,
}

/// Names of the enhanced (auxiliary/derived) features, used by the quality
/// analyzer for coverage reporting.
pub const ENHANCED_FEATURES: &[&str] = &[
    "fuel_price_lag_1d",
    "fuel_price_lag_7d",
    "fuel_price_lag_30d",
    "curtailment_estimate_mw",
];

impl FeatureRecord {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            price_lag_1h: None,
            price_lag_24h: None,
            rolling_mean_1h: None,
            rolling_mean_24h: None,
            volatility_1h: None,
            volatility_24h: None,
            momentum_3h: None,
            momentum_24h: None,
            fuel_price_lag_1d: None,
            fuel_price_lag_7d: None,
            fuel_price_lag_30d: None,
            curtailment_estimate_mw: None,
        }
    }

    /// Look a feature up by name. Used for coverage statistics.
    pub fn feature(&self, name: &str) -> Option<f64> {
        match name {
            "price_lag_1h" => self.price_lag_1h,
            "price_lag_24h" => self.price_lag_24h,
            "rolling_mean_1h" => self.rolling_mean_1h,
            "rolling_mean_24h" => self.rolling_mean_24h,
            "volatility_1h" => self.volatility_1h,
            "volatility_24h" => self.volatility_24h,
            "momentum_3h" => self.momentum_3h,
            "momentum_24h" => self.momentum_24h,
            "fuel_price_lag_1d" => self.fuel_price_lag_1d,
            "fuel_price_lag_7d" => self.fuel_price_lag_7d,
            "fuel_price_lag_30d" => self.fuel_price_lag_30d,
            "curtailment_estimate_mw" => self.curtailment_estimate_mw,
            _ => None,
        }
    }
}
