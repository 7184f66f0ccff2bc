use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A price prediction for one future hour.
///
/// Several predictions may exist for the same target hour, generated at
/// different lead times; the most recently created one is authoritative for
/// cache lookups. `validated_at` is written exactly once by the accuracy
/// tracker, after which the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub target_timestamp: DateTime<Utc>,
    pub horizon_hours: u32,
    pub predicted_price: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    /// 0..1, lower for longer horizons and wider intervals.
    pub confidence_score: f64,
    pub model_version: String,
    pub features_used: Vec<String>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.created_at <= ttl
    }
}
