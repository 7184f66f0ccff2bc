use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Coarse bucket for how extreme a realized price was, so accuracy can be
/// reported separately for calm and spiking markets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Regime {
    Normal,
    Elevated,
    Spike,
}

impl Regime {
    pub fn classify(price: f64, elevated_threshold: f64, spike_threshold: f64) -> Self {
        if price >= spike_threshold {
            Regime::Spike
        } else if price >= elevated_threshold {
            Regime::Elevated
        } else {
            Regime::Normal
        }
    }
}

/// Outcome of matching one prediction against the realized price.
/// Append-only; written exactly once per validated prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub prediction_id: Uuid,
    pub target_timestamp: DateTime<Utc>,
    pub predicted_price: f64,
    pub actual_price: f64,
    pub absolute_error: f64,
    pub percent_error: f64,
    pub symmetric_percent_error: f64,
    pub horizon_hours: u32,
    pub within_confidence_interval: bool,
    pub actual_regime: Regime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_inclusive_thresholds() {
        assert_eq!(Regime::classify(55.0, 100.0, 500.0), Regime::Normal);
        assert_eq!(Regime::classify(100.0, 100.0, 500.0), Regime::Elevated);
        assert_eq!(Regime::classify(499.9, 100.0, 500.0), Regime::Elevated);
        assert_eq!(Regime::classify(500.0, 100.0, 500.0), Regime::Spike);
        assert_eq!(Regime::classify(999.99, 100.0, 500.0), Regime::Spike);
    }

    #[test]
    fn regime_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(Regime::Spike.to_string(), "spike");
        assert_eq!(Regime::from_str("elevated").unwrap(), Regime::Elevated);
    }
}
