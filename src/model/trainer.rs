use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::dataset::{self, training_rows};
use super::{ModelEngine, ModelRequest, ModelResponse, TrainRequest};
use crate::config::RetrainingConfig;
use crate::domain::{Hyperparameters, ModelVersion};
use crate::store::ForecastStore;

/// Fits a new model version from the persisted history.
///
/// Failure at any step leaves the previously active version untouched; a
/// version is only inserted after the fit and its held-out evaluation both
/// succeed.
pub struct ModelTrainer {
    store: Arc<dyn ForecastStore>,
    engine: ModelEngine,
    cfg: RetrainingConfig,
}

impl ModelTrainer {
    pub fn new(store: Arc<dyn ForecastStore>, cfg: RetrainingConfig) -> Self {
        Self {
            store,
            engine: ModelEngine::new(),
            cfg,
        }
    }

    pub async fn train(&self, hyperparameters: Hyperparameters) -> Result<ModelVersion> {
        let observations = self.store.all_observations().await?;
        let features = self.store.all_features().await?;
        let rows = training_rows(&observations, &features);

        if rows.len() < self.cfg.min_training_records {
            warn!(
                usable = rows.len(),
                required = self.cfg.min_training_records,
                "not enough usable rows to train"
            );
            anyhow::bail!(
                "insufficient training data: {} usable rows, need {}",
                rows.len(),
                self.cfg.min_training_records
            );
        }

        let record_count = rows.len();
        let (design, targets): (Vec<Vec<f64>>, Vec<f64>) =
            rows.into_iter().map(|r| (r.features, r.target)).unzip();

        let response = self
            .engine
            .handle(ModelRequest::Train(TrainRequest {
                rows: design,
                targets,
                hyperparameters: hyperparameters.clone(),
                holdout_ratio: self.cfg.holdout_ratio,
                feature_names: dataset::feature_names(),
            }))
            .context("model fit failed")?;

        let ModelResponse::Trained { artifact, holdout_metrics } = response else {
            anyhow::bail!("unexpected engine response to a train request");
        };

        let version = ModelVersion {
            version_id: Uuid::new_v4(),
            trained_at: Utc::now(),
            hyperparameters,
            performance: holdout_metrics,
            training_record_count: record_count,
            artifact,
        };
        self.store.insert_model_version(version.clone()).await?;

        info!(
            version_id = %version.version_id,
            records = record_count,
            mae = version.performance.mae,
            smape = version.performance.smape,
            "trained new model version"
        );
        Ok(version)
    }
}
