use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use validator::Validate;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    domain::{ForecastTelemetry, Hyperparameters, PerformanceMetrics},
    predictor::ForecastResult,
    quality::QualityReport,
    scheduler::{AppState, RetrainingOutcome, SearchOutcome},
    validation::{AccuracySummary, CvReport},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health_report))
        .route("/forecast", get(get_forecast).post(post_forecast))
        .route("/model/train", post(train_model))
        .route("/cross-validation", post(run_cross_validation))
        .route("/predictions/validate", post(validate_predictions))
        .route("/data-quality", get(latest_data_quality).post(analyze_data_quality))
        .route("/features/calculate", post(calculate_features))
        .route("/retraining/check", post(check_auto_retraining))
        .route("/retraining/search", post(hyperparameter_search))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub store_reachable: bool,
    pub observation_count: usize,
    pub has_active_model: bool,
    /// When the retraining loop last ran, triggered or not.
    pub last_retraining_check: Option<DateTime<Utc>>,
}

pub async fn health_report(State(st): State<AppState>) -> Result<Json<ApiResponse<HealthReport>>, ApiError> {
    let store_reachable = st.store.health_check().await.is_ok();
    let observation_count = st.store.all_observations().await.map(|o| o.len()).unwrap_or(0);
    let has_active_model = st
        .store
        .active_model()
        .await
        .map(|m| m.is_some())
        .unwrap_or(false);
    let last_retraining_check = st
        .store
        .latest_retraining_event()
        .await
        .ok()
        .flatten()
        .map(|e| e.created_at);

    let status = if store_reachable { "healthy" } else { "degraded" };
    Ok(Json(ApiResponse::success(HealthReport {
        status: status.to_string(),
        store_reachable,
        observation_count,
        has_active_model,
        last_retraining_check,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastQuery {
    /// Horizon like "24h"; a bare number of hours is also accepted.
    pub horizon: Option<String>,
    pub force_refresh: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResponse {
    pub predictions: Vec<ForecastEntry>,
    pub performance: PerformanceSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastEntry {
    pub timestamp: DateTime<Utc>,
    pub horizon_hours: u32,
    pub price: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub confidence_score: f64,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_duration_ms: u64,
    pub cache_hit_count: usize,
    pub cache_miss_count: usize,
    pub cache_hit_rate_percent: f64,
    pub new_predictions_generated: usize,
}

impl From<ForecastResult> for ForecastResponse {
    fn from(result: ForecastResult) -> Self {
        let ForecastTelemetry {
            total_duration_ms,
            cache_hit_count,
            cache_miss_count,
            cache_hit_rate_percent,
            new_predictions_generated,
            ..
        } = result.performance;
        Self {
            predictions: result
                .predictions
                .into_iter()
                .map(|p| ForecastEntry {
                    timestamp: p.prediction.target_timestamp,
                    horizon_hours: p.prediction.horizon_hours,
                    price: p.prediction.predicted_price,
                    confidence_lower: p.prediction.confidence_lower,
                    confidence_upper: p.prediction.confidence_upper,
                    confidence_score: p.prediction.confidence_score,
                    cached: p.cached,
                })
                .collect(),
            performance: PerformanceSummary {
                total_duration_ms,
                cache_hit_count,
                cache_miss_count,
                cache_hit_rate_percent,
                new_predictions_generated,
            },
        }
    }
}

pub async fn get_forecast(
    State(st): State<AppState>,
    Query(q): Query<ForecastQuery>,
) -> Result<Json<ApiResponse<ForecastResponse>>, ApiError> {
    resolve_forecast(st, q).await
}

/// Same contract as the GET route, parameters in a JSON body.
pub async fn post_forecast(
    State(st): State<AppState>,
    body: Option<Json<ForecastQuery>>,
) -> Result<Json<ApiResponse<ForecastResponse>>, ApiError> {
    let q = body.map(|Json(q)| q).unwrap_or_default();
    resolve_forecast(st, q).await
}

async fn resolve_forecast(
    st: AppState,
    q: ForecastQuery,
) -> Result<Json<ApiResponse<ForecastResponse>>, ApiError> {
    let horizon = parse_horizon(q.horizon.as_deref().unwrap_or("24h"))
        .map_err(ApiError::BadRequest)?;
    let result = st
        .predictor
        .get_forecast(horizon, q.force_refresh.unwrap_or(false))
        .await?;
    Ok(Json(ApiResponse::success(ForecastResponse::from(result))))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainResponse {
    pub model_version: String,
    pub performance_metrics: TrainMetrics,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub smape: f64,
    pub r_squared: f64,
    pub training_records: usize,
}

pub async fn train_model(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<TrainResponse>>, ApiError> {
    let started = Instant::now();
    let version = st
        .trainer
        .train(Hyperparameters {
            l2_penalty: st.cfg.retraining.l2_penalty,
        })
        .await
        .map_err(|e| ApiError::TrainingFailed(e.to_string()))?;

    let PerformanceMetrics { mae, rmse, smape, r_squared, .. } = version.performance;
    Ok(Json(
        ApiResponse::success(TrainResponse {
            model_version: version.version_id.to_string(),
            performance_metrics: TrainMetrics {
                mae,
                rmse,
                smape,
                r_squared,
                training_records: version.training_record_count,
            },
        })
        .with_duration(started.elapsed().as_millis() as u64),
    ))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CrossValidationRequest {
    #[validate(range(min = 2, max = 20))]
    pub num_folds: usize,
    #[validate(range(min = 1, max = 720))]
    pub validation_window_hours: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossValidationResponse {
    pub fold_results: Vec<FoldResult>,
    pub average_metrics: Option<PerformanceMetrics>,
    pub skipped_folds: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldResult {
    pub fold_number: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub validation_start: DateTime<Utc>,
    pub validation_end: DateTime<Utc>,
    pub metrics: PerformanceMetrics,
}

impl From<CvReport> for CrossValidationResponse {
    fn from(report: CvReport) -> Self {
        Self {
            fold_results: report
                .fold_results
                .into_iter()
                .map(|f| FoldResult {
                    fold_number: f.fold_number,
                    train_start: f.train_start,
                    train_end: f.train_end,
                    validation_start: f.validation_start,
                    validation_end: f.validation_end,
                    metrics: f.metrics,
                })
                .collect(),
            average_metrics: report.average_metrics,
            skipped_folds: report.skipped_folds,
        }
    }
}

pub async fn run_cross_validation(
    State(st): State<AppState>,
    Json(req): Json<CrossValidationRequest>,
) -> Result<Json<ApiResponse<CrossValidationResponse>>, ApiError> {
    req.validate()?;
    let report = st
        .cross_validator
        .run(req.num_folds, req.validation_window_hours)
        .await?;
    Ok(Json(ApiResponse::success(report.into())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePredictionsRequest {
    pub batch_limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePredictionsResponse {
    pub validated: usize,
    pub errors: usize,
    pub deferred: usize,
    pub summary_by_horizon: HashMap<String, AccuracySummary>,
    pub summary_by_regime: HashMap<String, AccuracySummary>,
}

pub async fn validate_predictions(
    State(st): State<AppState>,
    body: Option<Json<ValidatePredictionsRequest>>,
) -> Result<Json<ApiResponse<ValidatePredictionsResponse>>, ApiError> {
    let limit = body
        .and_then(|Json(req)| req.batch_limit)
        .unwrap_or(st.cfg.validation.batch_limit);
    let outcome = st.tracker.validate_due(limit).await?;
    Ok(Json(ApiResponse::success(ValidatePredictionsResponse {
        validated: outcome.validated,
        errors: outcome.errors,
        deferred: outcome.deferred,
        summary_by_horizon: outcome.summary_by_horizon,
        summary_by_regime: outcome.summary_by_regime,
    })))
}

/// Latest persisted report, for dashboards that poll without recomputing.
pub async fn latest_data_quality(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<QualityReport>>, ApiError> {
    let report = st
        .store
        .latest_quality_report()
        .await?
        .ok_or_else(|| ApiError::NotFound("no quality report generated yet".to_string()))?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn analyze_data_quality(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<QualityReport>>, ApiError> {
    let observations = st.store.all_observations().await?;
    let features = st.store.all_features().await?;
    let report = st.quality.analyze(Utc::now(), &observations, &features);
    st.store.insert_quality_report(report.clone()).await?;
    Ok(Json(ApiResponse::success(report)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateFeaturesResponse {
    pub features_calculated: usize,
}

pub async fn calculate_features(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<CalculateFeaturesResponse>>, ApiError> {
    let started = Instant::now();
    let features_calculated = st.recalculate_features().await?;
    Ok(Json(
        ApiResponse::success(CalculateFeaturesResponse { features_calculated })
            .with_duration(started.elapsed().as_millis() as u64),
    ))
}

pub async fn check_auto_retraining(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<RetrainingOutcome>>, ApiError> {
    let outcome = st.scheduler.check().await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn hyperparameter_search(
    State(st): State<AppState>,
) -> Result<Json<ApiResponse<SearchOutcome>>, ApiError> {
    let outcome = st.scheduler.hyperparameter_search().await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Accepts "24h" or "24".
fn parse_horizon(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim().trim_end_matches(['h', 'H']);
    trimmed
        .parse::<u32>()
        .ok()
        .filter(|h| *h >= 1)
        .ok_or_else(|| format!("invalid horizon '{raw}'; expected e.g. \"24h\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("24h", Some(24))]
    #[case("6", Some(6))]
    #[case(" 48H ", Some(48))]
    #[case("0h", None)]
    #[case("day", None)]
    #[case("-3h", None)]
    fn horizon_parser_accepts_suffixed_and_bare_hours(
        #[case] raw: &str,
        #[case] expected: Option<u32>,
    ) {
        assert_eq!(parse_horizon(raw).ok(), expected);
    }

    #[test]
    fn cross_validation_request_bounds_are_enforced() {
        let bad = CrossValidationRequest { num_folds: 1, validation_window_hours: 24 };
        assert!(bad.validate().is_err());
        let good = CrossValidationRequest { num_folds: 5, validation_window_hours: 24 };
        assert!(good.validate().is_ok());
    }
}
