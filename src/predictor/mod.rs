//! The request-facing forecast path: resolve an N-hour-ahead forecast by
//! reusing fresh cached predictions and generating only the missing hours in
//! bounded batches.
//!
//! Cache lookup always completes before any generation starts, because the
//! lookup decides what to generate. Batches run sequentially to bound load
//! on the inference capability. Under concurrent callers inside one TTL
//! window the keyed upserts converge, so inference cost stays at roughly one
//! generation per hour per TTL window.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ForecastConfig;
use crate::domain::{floor_to_hour, FeatureRecord, ForecastTelemetry, Observation, Prediction};
use crate::model::dataset::{self, temporal_features};
use crate::model::{ModelEngine, ModelRequest, ModelResponse, PredictRequest};
use crate::store::ForecastStore;

const FALLBACK_MODEL_VERSION: &str = "persistence-fallback";

/// One forecast entry plus whether it was served from cache.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastPoint {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastResult {
    /// Exactly the requested number of hours, ascending by target.
    pub predictions: Vec<ForecastPoint>,
    pub performance: ForecastTelemetry,
}

pub struct OptimizedPredictor {
    store: Arc<dyn ForecastStore>,
    engine: ModelEngine,
    cfg: ForecastConfig,
}

impl OptimizedPredictor {
    pub fn new(store: Arc<dyn ForecastStore>, cfg: ForecastConfig) -> Self {
        Self {
            store,
            engine: ModelEngine::new(),
            cfg,
        }
    }

    pub async fn get_forecast(
        &self,
        horizon_hours: u32,
        force_refresh: bool,
    ) -> Result<ForecastResult> {
        let started = Instant::now();
        let now = Utc::now();
        let horizon = horizon_hours.clamp(1, self.cfg.max_horizon_hours) as usize;

        // Target hours are strictly in the future: the first one is the
        // next full hour after `now`.
        let first_hour = floor_to_hour(now) + Duration::hours(1);
        let target_hours: Vec<DateTime<Utc>> = (0..horizon)
            .map(|i| first_hour + Duration::hours(i as i64))
            .collect();
        let window_end = target_hours[target_hours.len() - 1];

        let hits = if force_refresh {
            HashMap::new()
        } else {
            self.cache_hits(now, window_end, &target_hours).await?
        };
        let misses: Vec<DateTime<Utc>> = target_hours
            .iter()
            .filter(|h| !hits.contains_key(*h))
            .copied()
            .collect();
        let hit_count = target_hours.len() - misses.len();
        let miss_count = misses.len();

        let (generated, batch_count) = self.generate_misses(&misses, now).await?;

        if !generated.is_empty() {
            self.store.insert_predictions(generated.clone()).await?;
        }

        let mut by_hour: HashMap<DateTime<Utc>, ForecastPoint> = HashMap::new();
        for (hour, prediction) in hits {
            by_hour.insert(hour, ForecastPoint { prediction, cached: true });
        }
        for prediction in generated {
            by_hour.insert(
                floor_to_hour(prediction.target_timestamp),
                ForecastPoint { prediction, cached: false },
            );
        }

        // Hours lost to a failed batch get a carry-forward fallback so the
        // response still has exactly `horizon` entries.
        let missing_after_generation: Vec<DateTime<Utc>> = target_hours
            .iter()
            .filter(|h| !by_hour.contains_key(*h))
            .copied()
            .collect();
        if !missing_after_generation.is_empty() {
            let fallbacks = self.persistence_fallbacks(&missing_after_generation, now).await?;
            self.store.insert_predictions(fallbacks.clone()).await?;
            for prediction in fallbacks {
                by_hour.insert(
                    floor_to_hour(prediction.target_timestamp),
                    ForecastPoint { prediction, cached: false },
                );
            }
        }

        let mut predictions: Vec<ForecastPoint> = by_hour.into_values().collect();
        predictions.sort_by_key(|p| p.prediction.target_timestamp);
        predictions.truncate(horizon);

        let new_generated = predictions.iter().filter(|p| !p.cached).count();
        let performance = ForecastTelemetry {
            created_at: now,
            total_duration_ms: started.elapsed().as_millis() as u64,
            cache_hit_count: hit_count,
            cache_miss_count: miss_count,
            cache_hit_rate_percent: hit_count as f64 / horizon as f64 * 100.0,
            batch_count,
            new_predictions_generated: new_generated,
        };

        // Telemetry must never block or fail the forecast path.
        let store = self.store.clone();
        let row = performance.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_telemetry(row).await {
                warn!(error = %e, "failed to record forecast telemetry");
            }
        });

        debug!(
            horizon,
            hit_count, miss_count, batch_count, "forecast resolved"
        );
        Ok(ForecastResult { predictions, performance })
    }

    /// Fresh predictions inside the window, deduplicated to the most
    /// recently created one per target hour.
    async fn cache_hits(
        &self,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
        target_hours: &[DateTime<Utc>],
    ) -> Result<HashMap<DateTime<Utc>, Prediction>> {
        let ttl = Duration::minutes(self.cfg.cache_ttl_minutes);
        let existing = self.store.predictions_targeting(now, window_end).await?;

        let mut hits: HashMap<DateTime<Utc>, Prediction> = HashMap::new();
        for prediction in existing {
            if !prediction.is_fresh(now, ttl) {
                continue;
            }
            let hour = floor_to_hour(prediction.target_timestamp);
            if !target_hours.contains(&hour) {
                continue;
            }
            match hits.get(&hour) {
                Some(kept) if kept.created_at >= prediction.created_at => {}
                _ => {
                    hits.insert(hour, prediction);
                }
            }
        }
        Ok(hits)
    }

    /// Generate predictions for the missed hours in fixed-size batches. A
    /// failed batch is logged and skipped; the remaining batches still run.
    async fn generate_misses(
        &self,
        misses: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<(Vec<Prediction>, usize)> {
        if misses.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let active = self.store.active_model().await?;
        let Some(model) = active else {
            warn!("no active model; forecast degrades to persistence fallback");
            return Ok((Vec::new(), 0));
        };

        let observations = self.store.all_observations().await?;
        let history: Vec<Observation> = observations
            .into_iter()
            .filter(|o| o.timestamp <= now)
            .collect();
        let latest_features = self
            .store
            .all_features()
            .await?
            .into_iter()
            .filter(|f| f.timestamp <= now)
            .next_back();

        let mut generated = Vec::new();
        let mut batch_count = 0;
        for batch in misses.chunks(self.cfg.generation_batch_hours.max(1) as usize) {
            batch_count += 1;
            let rows: Vec<Vec<f64>> = batch
                .iter()
                .map(|target| future_row(*target, &history, latest_features.as_ref()))
                .collect();

            match self.engine.handle(ModelRequest::Predict(PredictRequest {
                artifact: model.artifact.clone(),
                rows,
            })) {
                Ok(ModelResponse::Predicted(estimates)) => {
                    for (target, estimate) in batch.iter().zip(estimates) {
                        generated.push(Prediction {
                            prediction_id: Uuid::new_v4(),
                            created_at: now,
                            target_timestamp: *target,
                            horizon_hours: hours_ahead(now, *target),
                            predicted_price: estimate.value,
                            confidence_lower: estimate.lower,
                            confidence_upper: estimate.upper,
                            confidence_score: estimate.confidence,
                            model_version: model.version_id.to_string(),
                            features_used: dataset::feature_names(),
                            validated_at: None,
                        });
                    }
                }
                Ok(_) => warn!("unexpected engine response to a predict request"),
                Err(e) => {
                    warn!(batch = batch_count, error = %e, "prediction batch failed, skipping");
                }
            }
        }
        Ok((generated, batch_count))
    }

    /// Carry-forward predictions at low confidence, used when generation
    /// could not cover an hour.
    async fn persistence_fallbacks(
        &self,
        hours: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<Vec<Prediction>> {
        let last_price = self
            .store
            .latest_observation()
            .await?
            .and_then(|o| o.price)
            .unwrap_or(0.0);
        let margin = (last_price.abs() * 0.5).max(10.0);

        Ok(hours
            .iter()
            .map(|target| Prediction {
                prediction_id: Uuid::new_v4(),
                created_at: now,
                target_timestamp: *target,
                horizon_hours: hours_ahead(now, *target),
                predicted_price: last_price,
                confidence_lower: last_price - margin,
                confidence_upper: last_price + margin,
                confidence_score: 0.2,
                model_version: FALLBACK_MODEL_VERSION.to_string(),
                features_used: vec!["persistence".to_string()],
                validated_at: None,
            })
            .collect())
    }
}

fn hours_ahead(now: DateTime<Utc>, target: DateTime<Utc>) -> u32 {
    ((target - now).num_minutes() as f64 / 60.0).ceil().max(1.0) as u32
}

/// Design row for a future hour, built only from observations at or before
/// `now`. Unknown lags fall back to the most recent known price.
fn future_row(
    target: DateTime<Utc>,
    history: &[Observation],
    latest_features: Option<&FeatureRecord>,
) -> Vec<f64> {
    let price_by_hour: HashMap<DateTime<Utc>, f64> = history
        .iter()
        .filter_map(|o| o.price.map(|p| (floor_to_hour(o.timestamp), p)))
        .collect();
    let known_prices: Vec<f64> = history.iter().filter_map(|o| o.price).collect();
    let last_price = known_prices.last().copied().unwrap_or(0.0);

    let hour = floor_to_hour(target);
    let lag_1h = price_by_hour
        .get(&(hour - Duration::hours(1)))
        .copied()
        .unwrap_or(last_price);
    let lag_24h = price_by_hour
        .get(&(hour - Duration::hours(24)))
        .copied()
        .unwrap_or(last_price);

    let window: Vec<f64> = known_prices.iter().rev().take(25).copied().collect();
    let rolling_mean = if window.is_empty() {
        last_price
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    };
    let volatility = if window.len() >= 2 {
        let mean = rolling_mean;
        (window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (window.len() - 1) as f64).sqrt()
    } else {
        0.0
    };
    let momentum = if known_prices.len() > 3 {
        let base = known_prices[known_prices.len() - 4];
        if base.abs() > 1e-9 {
            (last_price - base) / base * 100.0
        } else {
            0.0
        }
    } else {
        0.0
    };

    // Demand persists daily: yesterday's same hour, else the latest reading.
    let demand = history
        .iter()
        .rev()
        .find(|o| floor_to_hour(o.timestamp) == hour - Duration::hours(24))
        .and_then(|o| o.demand_mw)
        .or_else(|| history.iter().rev().find_map(|o| o.demand_mw))
        .unwrap_or(0.0);

    let (hour_sin, hour_cos, is_weekend) = temporal_features(target);
    let (fuel, has_fuel) = match latest_features.and_then(|f| f.fuel_price_lag_1d) {
        Some(v) => (v, 1.0),
        None => (0.0, 0.0),
    };

    vec![
        lag_1h,
        lag_24h,
        rolling_mean,
        volatility,
        momentum,
        demand,
        hour_sin,
        hour_cos,
        is_weekend,
        fuel,
        has_fuel,
    ]
}
