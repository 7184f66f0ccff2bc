//! Time-series cross-validation.
//!
//! Folds are expanding-window and strictly chronological: each fold trains
//! on everything before its validation window and validates on a window no
//! other fold validates on. History is never shuffled; shuffling hourly
//! price data leaks future structure into training.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RetrainingConfig;
use crate::domain::{CvFold, PerformanceMetrics};
use crate::model::dataset::{self, training_rows, TrainingRow};
use crate::model::{
    ModelEngine, ModelRequest, ModelResponse, TrainRequest, ValidateRequest,
};
use crate::store::ForecastStore;

#[derive(Debug, Clone, Serialize)]
pub struct CvReport {
    pub fold_results: Vec<CvFold>,
    /// Simple mean of each metric across completed folds; `None` when every
    /// fold was skipped.
    pub average_metrics: Option<PerformanceMetrics>,
    pub skipped_folds: usize,
}

pub struct CrossValidator {
    store: Arc<dyn ForecastStore>,
    engine: ModelEngine,
    cfg: RetrainingConfig,
}

impl CrossValidator {
    pub fn new(store: Arc<dyn ForecastStore>, cfg: RetrainingConfig) -> Self {
        Self {
            store,
            engine: ModelEngine::new(),
            cfg,
        }
    }

    pub async fn run(&self, num_folds: usize, validation_window_hours: usize) -> Result<CvReport> {
        let observations = self.store.all_observations().await?;
        let features = self.store.all_features().await?;
        let rows = training_rows(&observations, &features);

        let window = validation_window_hours.max(1);
        let mut fold_results = Vec::new();
        let mut skipped = 0;

        for k in 0..num_folds {
            match self.run_fold(&rows, k, num_folds, window) {
                Some(fold) => fold_results.push(fold),
                None => skipped += 1,
            }
        }

        if !fold_results.is_empty() {
            self.store.insert_cv_folds(fold_results.clone()).await?;
        }

        let average_metrics = PerformanceMetrics::mean_of(
            &fold_results.iter().map(|f| f.metrics.clone()).collect::<Vec<_>>(),
        );

        info!(
            requested = num_folds,
            completed = fold_results.len(),
            skipped,
            "cross-validation finished"
        );
        Ok(CvReport {
            fold_results,
            average_metrics,
            skipped_folds: skipped,
        })
    }

    /// Validation windows tile the end of the series: fold `k` of `n`
    /// validates the `(n - k)`-th window from the end and trains on all
    /// rows before it. A fold that cannot meet the minimum training size,
    /// has no usable rows, or violates chronological ordering is skipped
    /// and excluded from the aggregate, never counted as zero-error.
    fn run_fold(
        &self,
        rows: &[TrainingRow],
        k: usize,
        num_folds: usize,
        window: usize,
    ) -> Option<CvFold> {
        let n = rows.len();
        let val_end = n.checked_sub((num_folds - 1 - k) * window)?;
        let val_start = val_end.checked_sub(window)?;
        if val_start < self.cfg.min_training_records {
            warn!(fold = k + 1, "skipping fold: training window below minimum");
            return None;
        }

        let train = &rows[..val_start];
        let validation = &rows[val_start..val_end];
        if train.is_empty() || validation.is_empty() {
            warn!(fold = k + 1, "skipping fold: empty window");
            return None;
        }

        let train_end = train[train.len() - 1].timestamp;
        let validation_start = validation[0].timestamp;
        if validation_start <= train_end {
            // Inverted ordering is an invariant violation: fatal for this
            // fold only.
            warn!(fold = k + 1, %train_end, %validation_start, "skipping fold: inverted ordering");
            return None;
        }

        let trained = self
            .engine
            .handle(ModelRequest::Train(TrainRequest {
                rows: train.iter().map(|r| r.features.clone()).collect(),
                targets: train.iter().map(|r| r.target).collect(),
                hyperparameters: Default::default(),
                holdout_ratio: self.cfg.holdout_ratio,
                feature_names: dataset::feature_names(),
            }))
            .map_err(|e| warn!(fold = k + 1, error = %e, "skipping fold: training failed"))
            .ok()?;
        let ModelResponse::Trained { artifact, .. } = trained else {
            return None;
        };

        let validated = self
            .engine
            .handle(ModelRequest::Validate(ValidateRequest {
                artifact,
                rows: validation.iter().map(|r| r.features.clone()).collect(),
                targets: validation.iter().map(|r| r.target).collect(),
            }))
            .map_err(|e| warn!(fold = k + 1, error = %e, "skipping fold: scoring failed"))
            .ok()?;
        let ModelResponse::Validated(metrics) = validated else {
            return None;
        };

        Some(CvFold {
            fold_number: k + 1,
            train_start: rows[0].timestamp,
            train_end,
            validation_start,
            validation_end: validation[validation.len() - 1].timestamp,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::domain::Observation;
    use crate::features::FeatureCalculator;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;

    async fn seeded(hours: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let observations: Vec<Observation> = (0..hours)
            .map(|i| {
                let angle = 2.0 * std::f64::consts::PI * (i % 24) as f64 / 24.0;
                Observation {
                    timestamp: base + Duration::hours(i as i64),
                    price: Some(50.0 + 10.0 * angle.sin() + (i % 7) as f64),
                    demand_mw: Some(9000.0 + 500.0 * angle.cos()),
                    generation_by_fuel: HashMap::from([("wind".to_string(), 700.0)]),
                    weather_by_station: HashMap::new(),
                    is_valid: true,
                }
            })
            .collect();
        store.upsert_observations(observations).await.unwrap();

        let calc = FeatureCalculator::new(FeatureConfig::default());
        calc.calculate_and_persist(store.as_ref(), &HashMap::new())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn folds_are_chronological_and_disjoint() {
        let store = seeded(24 * 30).await;
        let cv = CrossValidator::new(store, RetrainingConfig::default());

        let report = cv.run(3, 48).await.unwrap();
        assert_eq!(report.fold_results.len(), 3);
        assert!(report.average_metrics.is_some());

        for fold in &report.fold_results {
            assert!(fold.validation_start > fold.train_end);
        }
        for pair in report.fold_results.windows(2) {
            // No shared validation hours between folds.
            assert!(pair[1].validation_start > pair[0].validation_end);
        }
    }

    #[tokio::test]
    async fn short_history_skips_folds_instead_of_zero_scoring() {
        // 8 days of data cannot give 4 folds of 48h validation on top of a
        // 168h minimum training window.
        let store = seeded(24 * 8).await;
        let cv = CrossValidator::new(store, RetrainingConfig::default());

        let report = cv.run(4, 48).await.unwrap();
        assert!(report.skipped_folds > 0);
        let completed = report.fold_results.len();
        assert_eq!(completed + report.skipped_folds, 4);
        // Skipped folds are absent from the aggregate, not averaged as zero.
        if completed == 0 {
            assert!(report.average_metrics.is_none());
        }
    }

    #[tokio::test]
    async fn empty_store_completes_with_all_folds_skipped() {
        let store = Arc::new(MemoryStore::new());
        let cv = CrossValidator::new(store, RetrainingConfig::default());
        let report = cv.run(3, 24).await.unwrap();
        assert_eq!(report.fold_results.len(), 0);
        assert_eq!(report.skipped_folds, 3);
        assert!(report.average_metrics.is_none());
    }
}
