use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ForecastStore;
use crate::domain::{
    AccuracyRecord, CvFold, FeatureRecord, ForecastTelemetry, ModelVersion, Observation,
    Prediction, RetrainingEvent,
};
use crate::quality::QualityReport;

/// In-memory backing store. Timestamp-keyed maps give the same upsert
/// semantics a keyed table would; log collections are plain appends.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    observations: BTreeMap<DateTime<Utc>, Observation>,
    features: BTreeMap<DateTime<Utc>, FeatureRecord>,
    models: Vec<ModelVersion>,
    rollback_to: Option<Uuid>,
    predictions: HashMap<Uuid, Prediction>,
    accuracy: Vec<AccuracyRecord>,
    folds: Vec<CvFold>,
    retraining: Vec<RetrainingEvent>,
    quality_reports: Vec<QualityReport>,
    telemetry: Vec<ForecastTelemetry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn prediction_count(&self) -> usize {
        self.inner.read().await.predictions.len()
    }

    pub async fn accuracy_record_count(&self) -> usize {
        self.inner.read().await.accuracy.len()
    }

    pub async fn telemetry_rows(&self) -> Vec<ForecastTelemetry> {
        self.inner.read().await.telemetry.clone()
    }
}

#[async_trait]
impl ForecastStore for MemoryStore {
    async fn upsert_observations(&self, observations: Vec<Observation>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let count = observations.len();
        for obs in observations {
            inner.observations.insert(obs.timestamp, obs);
        }
        Ok(count)
    }

    async fn all_observations(&self) -> Result<Vec<Observation>> {
        Ok(self.inner.read().await.observations.values().cloned().collect())
    }

    async fn observation_near(
        &self,
        target: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<Observation>> {
        let inner = self.inner.read().await;
        let nearest = inner
            .observations
            .range(target - tolerance..=target + tolerance)
            .map(|(_, o)| o)
            .min_by_key(|o| (o.timestamp - target).num_seconds().abs());
        Ok(nearest.cloned())
    }

    async fn latest_observation(&self) -> Result<Option<Observation>> {
        Ok(self
            .inner
            .read()
            .await
            .observations
            .values()
            .next_back()
            .cloned())
    }

    async fn upsert_features(&self, batch: Vec<FeatureRecord>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let count = batch.len();
        for record in batch {
            inner.features.insert(record.timestamp, record);
        }
        Ok(count)
    }

    async fn all_features(&self) -> Result<Vec<FeatureRecord>> {
        Ok(self.inner.read().await.features.values().cloned().collect())
    }

    async fn insert_model_version(&self, version: ModelVersion) -> Result<()> {
        let mut inner = self.inner.write().await;
        // A fresh training run supersedes any recorded rollback.
        inner.rollback_to = None;
        inner.models.push(version);
        Ok(())
    }

    async fn active_model(&self) -> Result<Option<ModelVersion>> {
        let inner = self.inner.read().await;
        if let Some(pinned) = inner.rollback_to {
            return Ok(inner.models.iter().find(|m| m.version_id == pinned).cloned());
        }
        Ok(inner
            .models
            .iter()
            .max_by_key(|m| m.trained_at)
            .cloned())
    }

    async fn record_rollback(&self, version_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.models.iter().any(|m| m.version_id == version_id) {
            anyhow::bail!("unknown model version {version_id}");
        }
        inner.rollback_to = Some(version_id);
        Ok(())
    }

    async fn insert_predictions(&self, predictions: Vec<Prediction>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for pred in predictions {
            inner.predictions.insert(pred.prediction_id, pred);
        }
        Ok(())
    }

    async fn predictions_targeting(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Prediction>> {
        Ok(self
            .inner
            .read()
            .await
            .predictions
            .values()
            .filter(|p| p.target_timestamp > start && p.target_timestamp <= end)
            .cloned()
            .collect())
    }

    async fn due_predictions(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Prediction>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Prediction> = inner
            .predictions
            .values()
            .filter(|p| p.validated_at.is_none() && p.target_timestamp <= as_of)
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.target_timestamp, p.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_validated(
        &self,
        prediction_id: Uuid,
        validated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.predictions.get_mut(&prediction_id) {
            Some(pred) => {
                if pred.validated_at.is_none() {
                    pred.validated_at = Some(validated_at);
                }
                Ok(())
            }
            None => anyhow::bail!("unknown prediction {prediction_id}"),
        }
    }

    async fn insert_accuracy_record(&self, record: AccuracyRecord) -> Result<()> {
        self.inner.write().await.accuracy.push(record);
        Ok(())
    }

    async fn has_accuracy_record(&self, prediction_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .accuracy
            .iter()
            .any(|r| r.prediction_id == prediction_id))
    }

    async fn accuracy_records_since(&self, since: DateTime<Utc>) -> Result<Vec<AccuracyRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .accuracy
            .iter()
            .filter(|r| r.target_timestamp >= since)
            .cloned()
            .collect())
    }

    async fn insert_cv_folds(&self, folds: Vec<CvFold>) -> Result<()> {
        self.inner.write().await.folds.extend(folds);
        Ok(())
    }

    async fn insert_retraining_event(&self, event: RetrainingEvent) -> Result<()> {
        self.inner.write().await.retraining.push(event);
        Ok(())
    }

    async fn latest_retraining_event(&self) -> Result<Option<RetrainingEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .retraining
            .iter()
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn insert_quality_report(&self, report: QualityReport) -> Result<()> {
        self.inner.write().await.quality_reports.push(report);
        Ok(())
    }

    async fn latest_quality_report(&self) -> Result<Option<QualityReport>> {
        Ok(self
            .inner
            .read()
            .await
            .quality_reports
            .iter()
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn insert_telemetry(&self, row: ForecastTelemetry) -> Result<()> {
        self.inner.write().await.telemetry.push(row);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.inner.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn obs(ts: DateTime<Utc>, price: f64) -> Observation {
        Observation {
            timestamp: ts,
            price: Some(price),
            demand_mw: Some(9000.0),
            generation_by_fuel: StdHashMap::new(),
            weather_by_station: StdHashMap::new(),
            is_valid: true,
        }
    }

    #[tokio::test]
    async fn observation_upsert_replaces_same_hour() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        store.upsert_observations(vec![obs(ts, 40.0)]).await.unwrap();
        store.upsert_observations(vec![obs(ts, 45.0)]).await.unwrap();

        let all = store.all_observations().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].price, Some(45.0));
    }

    #[tokio::test]
    async fn observation_near_picks_closest_within_tolerance() {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        store
            .upsert_observations(vec![
                obs(base, 40.0),
                obs(base + Duration::minutes(20), 41.0),
            ])
            .await
            .unwrap();

        let target = base + Duration::minutes(15);
        let found = store
            .observation_near(target, Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.price, Some(41.0));

        let far = store
            .observation_near(base + Duration::hours(5), Duration::minutes(30))
            .await
            .unwrap();
        assert!(far.is_none());
    }

    #[tokio::test]
    async fn active_model_is_latest_unless_rolled_back() {
        use crate::domain::{Hyperparameters, ModelArtifact, PerformanceMetrics};

        let store = MemoryStore::new();
        let metrics = PerformanceMetrics::calculate(&[1.0, 2.0], &[1.0, 2.0]).unwrap();
        let artifact = ModelArtifact {
            coefficients: vec![0.5],
            intercept: 1.0,
            residual_std: 2.0,
            feature_names: vec!["price_lag_1h".to_string()],
        };
        let older = ModelVersion {
            version_id: Uuid::new_v4(),
            trained_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            hyperparameters: Hyperparameters::default(),
            performance: metrics.clone(),
            training_record_count: 100,
            artifact: artifact.clone(),
        };
        let newer = ModelVersion {
            version_id: Uuid::new_v4(),
            trained_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            hyperparameters: Hyperparameters::default(),
            performance: metrics,
            training_record_count: 200,
            artifact,
        };
        let older_id = older.version_id;
        let newer_id = newer.version_id;

        store.insert_model_version(older).await.unwrap();
        store.insert_model_version(newer).await.unwrap();
        assert_eq!(
            store.active_model().await.unwrap().unwrap().version_id,
            newer_id
        );

        store.record_rollback(older_id).await.unwrap();
        assert_eq!(
            store.active_model().await.unwrap().unwrap().version_id,
            older_id
        );
    }

    #[tokio::test]
    async fn mark_validated_is_write_once() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let pred = Prediction {
            prediction_id: Uuid::new_v4(),
            created_at: ts - Duration::hours(2),
            target_timestamp: ts,
            horizon_hours: 2,
            predicted_price: 50.0,
            confidence_lower: 40.0,
            confidence_upper: 60.0,
            confidence_score: 0.8,
            model_version: "test".to_string(),
            features_used: vec![],
            validated_at: None,
        };
        let id = pred.prediction_id;
        store.insert_predictions(vec![pred]).await.unwrap();

        let first = ts + Duration::hours(1);
        let second = ts + Duration::hours(2);
        store.mark_validated(id, first).await.unwrap();
        store.mark_validated(id, second).await.unwrap();

        let due = store.due_predictions(ts, 10).await.unwrap();
        assert!(due.is_empty());
    }
}
