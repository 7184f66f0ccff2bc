use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PerformanceMetrics;

/// Knobs the trainer accepts. Searched over by the retraining scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Ridge penalty on the regression coefficients.
    pub l2_penalty: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self { l2_penalty: 1.0 }
    }
}

/// The fitted artifact a model version carries: enough to reconstruct the
/// predictor without retraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Standard deviation of held-out residuals, drives interval width.
    pub residual_std: f64,
    pub feature_names: Vec<String>,
}

/// Immutable record of one training run. At most one version is active:
/// the latest by `trained_at`, unless a rollback pins an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version_id: Uuid,
    pub trained_at: DateTime<Utc>,
    pub hyperparameters: Hyperparameters,
    pub performance: PerformanceMetrics,
    pub training_record_count: usize,
    pub artifact: ModelArtifact,
}
