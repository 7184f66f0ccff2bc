//! End-to-end pipeline tests: seed a synthetic history, derive features,
//! train, forecast, then close the loop through validation, cross-validation
//! and the retraining check.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use pool_price_forecaster::config::Config;
use pool_price_forecaster::domain::{floor_to_hour, Hyperparameters, Prediction, Regime};
use pool_price_forecaster::scheduler::AppState;
use pool_price_forecaster::sim;
use pool_price_forecaster::store::{ForecastStore, MemoryStore};

const HISTORY_HOURS: usize = 24 * 60;

async fn trained_state() -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::with_store(Config::default(), store.clone())
        .await
        .expect("state construction");

    let seeded = sim::seed_if_empty(state.store.as_ref(), HISTORY_HOURS)
        .await
        .expect("seeding");
    assert_eq!(seeded, HISTORY_HOURS);

    let features = state.recalculate_features().await.expect("features");
    assert_eq!(features, HISTORY_HOURS);

    state
        .trainer
        .train(Hyperparameters::default())
        .await
        .expect("training on seeded history");
    (state, store)
}

#[tokio::test]
async fn cold_cache_forecast_generates_every_hour() {
    let (state, _store) = trained_state().await;

    let result = state.predictor.get_forecast(24, false).await.unwrap();

    assert_eq!(result.predictions.len(), 24);
    assert_eq!(result.performance.cache_hit_count, 0);
    assert_eq!(result.performance.cache_miss_count, 24);
    assert_eq!(result.performance.new_predictions_generated, 24);

    let now = Utc::now();
    for pair in result.predictions.windows(2) {
        let gap = pair[1].prediction.target_timestamp - pair[0].prediction.target_timestamp;
        assert_eq!(gap, Duration::hours(1));
    }
    for point in &result.predictions {
        assert!(point.prediction.target_timestamp > now);
        assert!(point.prediction.confidence_lower <= point.prediction.predicted_price);
        assert!(point.prediction.predicted_price <= point.prediction.confidence_upper);
    }
}

#[tokio::test]
async fn repeated_forecast_within_ttl_reuses_cached_predictions() {
    let (state, _store) = trained_state().await;

    let first = state.predictor.get_forecast(24, false).await.unwrap();
    let second = state.predictor.get_forecast(24, false).await.unwrap();

    assert!(second.performance.cache_hit_count >= 23);
    for point in &second.predictions {
        let original = first
            .predictions
            .iter()
            .find(|p| p.prediction.target_timestamp == point.prediction.target_timestamp);
        if let Some(original) = original {
            assert_eq!(
                original.prediction.predicted_price,
                point.prediction.predicted_price
            );
        }
    }
}

#[tokio::test]
async fn concurrent_forecast_calls_agree_on_every_hour() {
    let (state, _store) = trained_state().await;

    let results = join_all((0..4).map(|_| state.predictor.get_forecast(12, false))).await;
    let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    for result in &results {
        assert_eq!(result.predictions.len(), 12);
    }
    let reference = &results[0];
    for other in &results[1..] {
        for (a, b) in reference.predictions.iter().zip(other.predictions.iter()) {
            assert_eq!(a.prediction.target_timestamp, b.prediction.target_timestamp);
            assert_eq!(a.prediction.predicted_price, b.prediction.predicted_price);
        }
    }
}

#[tokio::test]
async fn validation_closes_the_loop_idempotently() {
    let (state, store) = trained_state().await;

    // Predictions whose target hours already settled, priced close to the
    // realized values so some land inside their intervals.
    let now = Utc::now();
    let mut past = Vec::new();
    for i in 1..=6i64 {
        let target = floor_to_hour(now) - Duration::hours(i);
        let actual = store
            .observation_near(target, Duration::minutes(30))
            .await
            .unwrap()
            .and_then(|o| o.price)
            .expect("seeded hour has a price");
        past.push(Prediction {
            prediction_id: Uuid::new_v4(),
            created_at: target - Duration::hours(2),
            target_timestamp: target,
            horizon_hours: 2,
            predicted_price: actual + 2.0,
            confidence_lower: actual - 10.0,
            confidence_upper: actual + 10.0,
            confidence_score: 0.8,
            model_version: "pipeline-test".to_string(),
            features_used: vec![],
            validated_at: None,
        });
    }
    store.insert_predictions(past).await.unwrap();

    let first = state.tracker.validate_due(100).await.unwrap();
    assert_eq!(first.validated, 6);
    assert_eq!(first.errors, 0);

    let second = state.tracker.validate_due(100).await.unwrap();
    assert_eq!(second.validated, 0);
    assert_eq!(store.accuracy_record_count().await, 6);

    let records = store
        .accuracy_records_since(now - Duration::days(1))
        .await
        .unwrap();
    for record in &records {
        assert!((record.absolute_error - 2.0).abs() < 1e-9);
        assert!(record.within_confidence_interval);
    }
    // Seeded prices sit far below the spike threshold.
    assert!(records.iter().all(|r| r.actual_regime == Regime::Normal));
}

#[tokio::test]
async fn cross_validation_folds_stay_chronological() {
    let (state, _store) = trained_state().await;

    let report = state.cross_validator.run(4, 48).await.unwrap();
    assert_eq!(report.fold_results.len() + report.skipped_folds, 4);
    assert!(!report.fold_results.is_empty());
    assert!(report.average_metrics.is_some());

    for fold in &report.fold_results {
        assert!(fold.validation_start > fold.train_end);
    }
    for pair in report.fold_results.windows(2) {
        assert!(pair[1].validation_start > pair[0].validation_end);
    }

    let avg = report.average_metrics.unwrap();
    assert!(avg.mae.is_finite() && avg.mae >= 0.0);
    assert!(avg.smape >= 0.0 && avg.smape <= 200.0);
}

#[tokio::test]
async fn quality_report_on_a_healthy_history_scores_high() {
    let (state, store) = trained_state().await;

    let observations = store.all_observations().await.unwrap();
    let features = store.all_features().await.unwrap();
    let report = state.quality.analyze(Utc::now(), &observations, &features);

    assert!(report.overall_quality_score > 80.0);
    assert!(report.missing_data.worst_rate_percent < 5.0);
    assert_eq!(report.continuity_score, 100.0);
}

#[tokio::test]
async fn fresh_model_passes_the_retraining_check() {
    let (state, store) = trained_state().await;

    let outcome = state.scheduler.check().await.unwrap();
    assert!(!outcome.retraining_completed);
    assert_eq!(outcome.reason, "within thresholds");

    // The check is audited even when nothing fires.
    let event = store.latest_retraining_event().await.unwrap().unwrap();
    assert!(!event.triggered);
    assert!(event.performance_before.is_some());
}

#[tokio::test]
async fn hyperparameter_search_pins_the_best_trial() {
    let (state, store) = trained_state().await;

    let outcome = state.scheduler.hyperparameter_search().await.unwrap();
    assert_eq!(outcome.trials.len(), 5);
    let best = outcome.best.expect("at least one trial succeeds");

    let active = store.active_model().await.unwrap().unwrap();
    assert_eq!(active.version_id, best.version_id);
    for trial in &outcome.trials {
        assert!(best.smape <= trial.smape);
    }
}

#[tokio::test]
async fn http_surface_serves_the_forecast_envelope() {
    let (state, _store) = trained_state().await;
    let cfg = state.cfg.clone();
    let app = pool_price_forecaster::api::router(state, &cfg);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{addr}/api/v1/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/v1/forecast?horizon=6h"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    let predictions = body["data"]["predictions"].as_array().unwrap();
    assert_eq!(predictions.len(), 6);
    assert!(predictions[0]["confidenceLower"].is_number());
    let performance = &body["data"]["performance"];
    assert_eq!(performance["cacheMissCount"], 6);
    assert!(performance["totalDurationMs"].is_number());

    // The POST variant takes the same parameters in a JSON body and is
    // served from the cache the GET call just warmed.
    let body: serde_json::Value = client
        .post(format!("http://{addr}/api/v1/forecast"))
        .json(&serde_json::json!({"horizon": "6h"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["predictions"].as_array().unwrap().len(), 6);

    // No quality report exists until one is computed.
    let missing = client
        .get(format!("http://{addr}/api/v1/data-quality"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let computed = client
        .post(format!("http://{addr}/api/v1/data-quality"))
        .send()
        .await
        .unwrap();
    assert_eq!(computed.status(), 200);

    let latest: serde_json::Value = client
        .get(format!("http://{addr}/api/v1/data-quality"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["success"], true);
    assert!(latest["data"]["overall_quality_score"].is_number());
}
