//! Closes the loop: matches past predictions against realized prices once
//! their target hour has elapsed.
//!
//! The pass is at-least-once and re-runnable. `validated_at` is only set
//! after the accuracy record is durably written, and already-validated
//! predictions never reappear in the due scan.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::domain::{symmetric_percent_error, AccuracyRecord, Prediction, Regime};
use crate::store::ForecastStore;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub validated: usize,
    pub errors: usize,
    /// Predictions whose actual has not arrived yet; retried next run.
    pub deferred: usize,
    pub summary_by_horizon: HashMap<String, AccuracySummary>,
    pub summary_by_regime: HashMap<String, AccuracySummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccuracySummary {
    pub count: usize,
    pub mean_absolute_error: f64,
    pub mean_symmetric_percent_error: f64,
    pub within_interval_percent: f64,
}

pub struct AccuracyTracker {
    store: Arc<dyn ForecastStore>,
    cfg: ValidationConfig,
}

impl AccuracyTracker {
    pub fn new(store: Arc<dyn ForecastStore>, cfg: ValidationConfig) -> Self {
        Self { store, cfg }
    }

    pub async fn validate_due(&self, batch_limit: usize) -> Result<ValidationOutcome> {
        let now = Utc::now();
        let due = self.store.due_predictions(now, batch_limit).await?;
        let tolerance = Duration::minutes(self.cfg.actual_match_tolerance_minutes);

        let mut validated = 0;
        let mut errors = 0;
        let mut deferred = 0;

        for prediction in due {
            // Grid data rarely lands exactly on the hour; accept the
            // closest observation inside the tolerance.
            let actual = self
                .store
                .observation_near(prediction.target_timestamp, tolerance)
                .await?
                .and_then(|o| o.price);
            let Some(actual_price) = actual else {
                deferred += 1;
                debug!(
                    prediction_id = %prediction.prediction_id,
                    target = %prediction.target_timestamp,
                    "no actual yet, deferring"
                );
                continue;
            };

            match self.validate_one(&prediction, actual_price, now).await {
                Ok(()) => validated += 1,
                Err(e) => {
                    errors += 1;
                    warn!(
                        prediction_id = %prediction.prediction_id,
                        error = %e,
                        "validation failed for prediction"
                    );
                }
            }
        }

        let since = now - Duration::days(30);
        let records = self.store.accuracy_records_since(since).await?;
        let outcome = ValidationOutcome {
            validated,
            errors,
            deferred,
            summary_by_horizon: summarize(&records, |r| horizon_bucket(r.horizon_hours).to_string()),
            summary_by_regime: summarize(&records, |r| r.actual_regime.to_string()),
        };

        info!(validated, errors, deferred, "validation sweep finished");
        Ok(outcome)
    }

    async fn validate_one(
        &self,
        prediction: &Prediction,
        actual_price: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // A record left behind by an earlier run that died before marking
        // the prediction: marking it now completes the pair.
        if !self.store.has_accuracy_record(prediction.prediction_id).await? {
            let record = build_record(prediction, actual_price, &self.cfg);
            self.store.insert_accuracy_record(record).await?;
        }
        self.store
            .mark_validated(prediction.prediction_id, now)
            .await
    }
}

fn build_record(
    prediction: &Prediction,
    actual_price: f64,
    cfg: &ValidationConfig,
) -> AccuracyRecord {
    let absolute_error = (actual_price - prediction.predicted_price).abs();
    let percent_error = if actual_price.abs() > 1e-6 {
        absolute_error / actual_price.abs() * 100.0
    } else {
        0.0
    };
    AccuracyRecord {
        prediction_id: prediction.prediction_id,
        target_timestamp: prediction.target_timestamp,
        predicted_price: prediction.predicted_price,
        actual_price,
        absolute_error,
        percent_error,
        symmetric_percent_error: symmetric_percent_error(actual_price, prediction.predicted_price),
        horizon_hours: prediction.horizon_hours,
        within_confidence_interval: prediction.confidence_lower <= actual_price
            && actual_price <= prediction.confidence_upper,
        actual_regime: Regime::classify(
            actual_price,
            cfg.elevated_threshold,
            cfg.spike_threshold,
        ),
    }
}

fn horizon_bucket(horizon_hours: u32) -> &'static str {
    match horizon_hours {
        0..=6 => "1-6h",
        7..=24 => "7-24h",
        _ => "25h+",
    }
}

fn summarize(
    records: &[AccuracyRecord],
    key: impl Fn(&AccuracyRecord) -> String,
) -> HashMap<String, AccuracySummary> {
    let mut grouped: HashMap<String, Vec<&AccuracyRecord>> = HashMap::new();
    for record in records {
        grouped.entry(key(record)).or_default().push(record);
    }

    grouped
        .into_iter()
        .map(|(bucket, group)| {
            let n = group.len() as f64;
            let summary = AccuracySummary {
                count: group.len(),
                mean_absolute_error: group.iter().map(|r| r.absolute_error).sum::<f64>() / n,
                mean_symmetric_percent_error: group
                    .iter()
                    .map(|r| r.symmetric_percent_error)
                    .sum::<f64>()
                    / n,
                within_interval_percent: group
                    .iter()
                    .filter(|r| r.within_confidence_interval)
                    .count() as f64
                    / n
                    * 100.0,
            };
            (bucket, summary)
        })
        .collect()
}
