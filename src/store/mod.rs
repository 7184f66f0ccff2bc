//! Persistence seam for the forecasting pipeline.
//!
//! Seven logical collections: observations, engineered features, model
//! versions, predictions, accuracy records, CV folds and retraining events
//! (plus quality reports and forecast telemetry). Writes are upserts keyed
//! by natural keys or append-only inserts, so concurrent writers converge
//! without locks.

pub mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{
    AccuracyRecord, CvFold, FeatureRecord, ForecastTelemetry, ModelVersion, Observation,
    Prediction, RetrainingEvent,
};
use crate::quality::QualityReport;

#[async_trait]
pub trait ForecastStore: Send + Sync {
    /// Upsert keyed by timestamp; re-ingesting the same hour replaces it.
    async fn upsert_observations(&self, observations: Vec<Observation>) -> Result<usize>;
    /// All observations ordered by timestamp ascending.
    async fn all_observations(&self) -> Result<Vec<Observation>>;
    /// Closest observation within `tolerance` of `target`, if any.
    async fn observation_near(
        &self,
        target: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<Observation>>;
    async fn latest_observation(&self) -> Result<Option<Observation>>;

    /// Upsert keyed by timestamp; recomputation must not duplicate rows.
    async fn upsert_features(&self, batch: Vec<FeatureRecord>) -> Result<usize>;
    async fn all_features(&self) -> Result<Vec<FeatureRecord>>;

    async fn insert_model_version(&self, version: ModelVersion) -> Result<()>;
    /// Latest version by `trained_at`, unless a rollback pins an earlier one.
    async fn active_model(&self) -> Result<Option<ModelVersion>>;
    async fn record_rollback(&self, version_id: Uuid) -> Result<()>;

    async fn insert_predictions(&self, predictions: Vec<Prediction>) -> Result<()>;
    /// Predictions with `target_timestamp` in `(start, end]`.
    async fn predictions_targeting(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Prediction>>;
    /// Unvalidated predictions whose target has elapsed, oldest target first.
    async fn due_predictions(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Prediction>>;
    /// Sets `validated_at` once; a second call is a no-op.
    async fn mark_validated(&self, prediction_id: Uuid, validated_at: DateTime<Utc>)
        -> Result<()>;

    async fn insert_accuracy_record(&self, record: AccuracyRecord) -> Result<()>;
    async fn has_accuracy_record(&self, prediction_id: Uuid) -> Result<bool>;
    async fn accuracy_records_since(&self, since: DateTime<Utc>) -> Result<Vec<AccuracyRecord>>;

    async fn insert_cv_folds(&self, folds: Vec<CvFold>) -> Result<()>;

    async fn insert_retraining_event(&self, event: RetrainingEvent) -> Result<()>;
    async fn latest_retraining_event(&self) -> Result<Option<RetrainingEvent>>;

    async fn insert_quality_report(&self, report: QualityReport) -> Result<()>;
    async fn latest_quality_report(&self) -> Result<Option<QualityReport>>;

    async fn insert_telemetry(&self, row: ForecastTelemetry) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}
