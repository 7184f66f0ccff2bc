//! The injectable price-regression capability.
//!
//! The pipeline never assumes a particular algorithm: everything upstream
//! talks to [`ModelEngine`] through the discriminated [`ModelRequest`]
//! variants, and everything downstream consumes [`PriceEstimate`]s. The
//! shipped implementation is a ridge regression solved in closed form.

pub mod dataset;
pub mod trainer;

pub use trainer::ModelTrainer;

use serde::{Deserialize, Serialize};

use crate::domain::{Hyperparameters, MetricsError, ModelArtifact, PerformanceMetrics};

/// A point prediction with its uncertainty interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    /// 0..1, shrinking as the interval widens relative to the point value.
    pub confidence: f64,
}

pub trait PriceModel: Send + Sync {
    fn predict(&self, features: &[f64]) -> PriceEstimate;
    fn feature_names(&self) -> &[String];
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Insufficient training data: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Normal equations are singular; features are degenerate")]
    SingularSystem,

    #[error("Feature dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// One entry point, three explicitly dispatched request kinds. Training,
/// validation and prediction never share a stringly-typed mode flag.
#[derive(Debug)]
pub enum ModelRequest {
    Train(TrainRequest),
    Validate(ValidateRequest),
    Predict(PredictRequest),
}

#[derive(Debug)]
pub struct TrainRequest {
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    pub hyperparameters: Hyperparameters,
    /// Chronological share of rows used for fitting; the tail is held out.
    pub holdout_ratio: f64,
    pub feature_names: Vec<String>,
}

#[derive(Debug)]
pub struct ValidateRequest {
    pub artifact: ModelArtifact,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

#[derive(Debug)]
pub struct PredictRequest {
    pub artifact: ModelArtifact,
    pub rows: Vec<Vec<f64>>,
}

#[derive(Debug)]
pub enum ModelResponse {
    Trained {
        artifact: ModelArtifact,
        holdout_metrics: PerformanceMetrics,
    },
    Validated(PerformanceMetrics),
    Predicted(Vec<PriceEstimate>),
}

/// Stateless dispatcher for the regression capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelEngine;

impl ModelEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        match request {
            ModelRequest::Train(req) => self.train(req),
            ModelRequest::Validate(req) => self.validate(req),
            ModelRequest::Predict(req) => self.predict(req),
        }
    }

    fn train(&self, req: TrainRequest) -> Result<ModelResponse, ModelError> {
        let n = req.rows.len();
        if n < 10 || n != req.targets.len() {
            return Err(ModelError::InsufficientData { needed: 10, got: n });
        }

        // Rows arrive in chronological order; the holdout is always the
        // most recent tail, never a shuffled sample.
        let split = ((n as f64 * req.holdout_ratio).floor() as usize).clamp(1, n - 1);
        let (train_rows, holdout_rows) = req.rows.split_at(split);
        let (train_targets, holdout_targets) = req.targets.split_at(split);

        let mut model = RidgeRegression::fit(
            train_rows,
            train_targets,
            req.hyperparameters.l2_penalty,
            req.feature_names.clone(),
        )?;

        let holdout_predicted: Vec<f64> =
            holdout_rows.iter().map(|r| model.point(r)).collect();
        let holdout_metrics =
            PerformanceMetrics::calculate(holdout_targets, &holdout_predicted)?;

        // Interval width comes from held-out residuals, not the fit itself.
        let residual_std = sample_std(
            &holdout_targets
                .iter()
                .zip(holdout_predicted.iter())
                .map(|(a, p)| a - p)
                .collect::<Vec<f64>>(),
        )
        .unwrap_or(model.residual_std);
        model.residual_std = residual_std;

        Ok(ModelResponse::Trained {
            artifact: model.artifact(),
            holdout_metrics,
        })
    }

    fn validate(&self, req: ValidateRequest) -> Result<ModelResponse, ModelError> {
        let model = RidgeRegression::from_artifact(&req.artifact);
        let predicted: Vec<f64> = req
            .rows
            .iter()
            .map(|r| {
                if r.len() != model.coefficients.len() {
                    return Err(ModelError::DimensionMismatch {
                        expected: model.coefficients.len(),
                        got: r.len(),
                    });
                }
                Ok(model.point(r))
            })
            .collect::<Result<_, _>>()?;
        let metrics = PerformanceMetrics::calculate(&req.targets, &predicted)?;
        Ok(ModelResponse::Validated(metrics))
    }

    fn predict(&self, req: PredictRequest) -> Result<ModelResponse, ModelError> {
        let model = RidgeRegression::from_artifact(&req.artifact);
        let estimates = req.rows.iter().map(|r| model.predict(r)).collect();
        Ok(ModelResponse::Predicted(estimates))
    }
}

/// Ridge regression fitted via the normal equations. The intercept is left
/// unpenalized.
#[derive(Debug, Clone)]
pub struct RidgeRegression {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub residual_std: f64,
    feature_names: Vec<String>,
}

impl RidgeRegression {
    pub fn fit(
        rows: &[Vec<f64>],
        targets: &[f64],
        l2_penalty: f64,
        feature_names: Vec<String>,
    ) -> Result<Self, ModelError> {
        let n = rows.len();
        let m = rows.first().map(|r| r.len()).unwrap_or(0);
        if n < m + 2 {
            return Err(ModelError::InsufficientData { needed: m + 2, got: n });
        }
        for row in rows {
            if row.len() != m {
                return Err(ModelError::DimensionMismatch { expected: m, got: row.len() });
            }
        }

        // Augmented system: column m is the intercept.
        let dim = m + 1;
        let mut xtx = vec![vec![0.0f64; dim]; dim];
        let mut xty = vec![0.0f64; dim];
        for (row, target) in rows.iter().zip(targets.iter()) {
            for i in 0..dim {
                let xi = if i < m { row[i] } else { 1.0 };
                xty[i] += xi * target;
                for j in 0..dim {
                    let xj = if j < m { row[j] } else { 1.0 };
                    xtx[i][j] += xi * xj;
                }
            }
        }
        for (i, xtx_row) in xtx.iter_mut().take(m).enumerate() {
            xtx_row[i] += l2_penalty;
        }

        let solution = solve(xtx, xty).ok_or(ModelError::SingularSystem)?;
        let (coefficients, intercept) = (solution[..m].to_vec(), solution[m]);

        let residuals: Vec<f64> = rows
            .iter()
            .zip(targets.iter())
            .map(|(row, target)| {
                let fitted: f64 = row
                    .iter()
                    .zip(coefficients.iter())
                    .map(|(x, c)| x * c)
                    .sum::<f64>()
                    + intercept;
                target - fitted
            })
            .collect();
        let residual_std = sample_std(&residuals).unwrap_or(0.0);

        Ok(Self {
            coefficients,
            intercept,
            residual_std,
            feature_names,
        })
    }

    pub fn from_artifact(artifact: &ModelArtifact) -> Self {
        Self {
            coefficients: artifact.coefficients.clone(),
            intercept: artifact.intercept,
            residual_std: artifact.residual_std,
            feature_names: artifact.feature_names.clone(),
        }
    }

    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            coefficients: self.coefficients.clone(),
            intercept: self.intercept,
            residual_std: self.residual_std,
            feature_names: self.feature_names.clone(),
        }
    }

    fn point(&self, features: &[f64]) -> f64 {
        features
            .iter()
            .zip(self.coefficients.iter())
            .map(|(x, c)| x * c)
            .sum::<f64>()
            + self.intercept
    }
}

impl PriceModel for RidgeRegression {
    fn predict(&self, features: &[f64]) -> PriceEstimate {
        let value = self.point(features);
        // 95% interval under a normal residual assumption.
        let margin = 1.96 * self.residual_std;
        let confidence =
            (1.0 / (1.0 + self.residual_std / value.abs().max(1.0))).clamp(0.05, 0.99);
        PriceEstimate {
            value,
            lower: value - margin,
            upper: value + margin,
            confidence,
        }
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }
}

/// Gaussian elimination with partial pivoting. `None` when the system is
/// singular.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot_row = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row][col].abs() < 1e-10 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let sum: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - sum) / a[row][row];
    }
    Some(x)
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}
