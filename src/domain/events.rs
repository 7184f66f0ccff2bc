use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PerformanceMetrics;

/// One chronological train/validation split produced by the cross-validator.
/// The validation window always starts strictly after the training window
/// ends; a fold that cannot satisfy that is discarded, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvFold {
    pub fold_number: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub validation_start: DateTime<Utc>,
    pub validation_end: DateTime<Utc>,
    pub metrics: PerformanceMetrics,
}

/// Audit entry for every retraining check, whether or not it fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingEvent {
    pub triggered: bool,
    pub reason: String,
    pub performance_before: Option<PerformanceMetrics>,
    pub performance_after: Option<PerformanceMetrics>,
    /// Relative sMAPE improvement in percent, positive is better.
    pub improvement_percent: Option<f64>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Cache performance for one forecast call. Written best-effort; the
/// retraining scheduler and dashboards read it, the forecast path never
/// blocks on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastTelemetry {
    pub created_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub cache_hit_count: usize,
    pub cache_miss_count: usize,
    pub cache_hit_rate_percent: f64,
    pub batch_count: usize,
    pub new_predictions_generated: usize,
}
