//! Forecast error metrics shared by the trainer, cross-validator and
//! accuracy tracker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate error metrics over a set of (actual, predicted) pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// Symmetric Mean Absolute Percentage Error (%). Bounded, robust near
    /// zero-price hours, unlike plain MAPE.
    pub smape: f64,
    /// Mean Absolute Percentage Error (%)
    pub mape: f64,
    /// Coefficient of determination
    pub r_squared: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MetricsError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,
}

/// Symmetric percent error of a single pair. The denominator averages the
/// magnitudes of actual and predicted; both near zero yields 0 rather than
/// a blow-up.
pub fn symmetric_percent_error(actual: f64, predicted: f64) -> f64 {
    let denom = (actual.abs() + predicted.abs()) / 2.0;
    if denom < 1e-6 {
        0.0
    } else {
        (actual - predicted).abs() / denom * 100.0
    }
}

impl PerformanceMetrics {
    pub fn calculate(actual: &[f64], predicted: &[f64]) -> Result<Self, MetricsError> {
        if actual.len() != predicted.len() {
            return Err(MetricsError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }
        if actual.is_empty() {
            return Err(MetricsError::EmptyData);
        }

        let n = actual.len() as f64;

        let mae = actual
            .iter()
            .zip(predicted.iter())
            .map(|(a, p)| (a - p).abs())
            .sum::<f64>()
            / n;

        let mse = actual
            .iter()
            .zip(predicted.iter())
            .map(|(a, p)| (a - p).powi(2))
            .sum::<f64>()
            / n;
        let rmse = mse.sqrt();

        let smape = actual
            .iter()
            .zip(predicted.iter())
            .map(|(a, p)| symmetric_percent_error(*a, *p))
            .sum::<f64>()
            / n;

        // Plain MAPE skips near-zero actuals entirely.
        let pct_errors: Vec<f64> = actual
            .iter()
            .zip(predicted.iter())
            .filter(|(a, _)| a.abs() > 1e-6)
            .map(|(a, p)| ((a - p).abs() / a.abs()) * 100.0)
            .collect();
        let mape = if pct_errors.is_empty() {
            0.0
        } else {
            pct_errors.iter().sum::<f64>() / pct_errors.len() as f64
        };

        let mean_actual = actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
        let ss_res: f64 = actual
            .iter()
            .zip(predicted.iter())
            .map(|(a, p)| (a - p).powi(2))
            .sum();
        let r_squared = if ss_tot > 1e-10 { 1.0 - ss_res / ss_tot } else { 0.0 };

        Ok(Self {
            mae,
            rmse,
            smape,
            mape,
            r_squared,
            sample_count: actual.len(),
        })
    }

    /// Simple unweighted mean of each metric across several results.
    pub fn mean_of(all: &[PerformanceMetrics]) -> Option<PerformanceMetrics> {
        if all.is_empty() {
            return None;
        }
        let n = all.len() as f64;
        Some(PerformanceMetrics {
            mae: all.iter().map(|m| m.mae).sum::<f64>() / n,
            rmse: all.iter().map(|m| m.rmse).sum::<f64>() / n,
            smape: all.iter().map(|m| m.smape).sum::<f64>() / n,
            mape: all.iter().map(|m| m.mape).sum::<f64>() / n,
            r_squared: all.iter().map(|m| m.r_squared).sum::<f64>() / n,
            sample_count: all.iter().map(|m| m.sample_count).sum(),
        })
    }
}

impl fmt::Display for PerformanceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAE={:.3}, RMSE={:.3}, sMAPE={:.2}%, MAPE={:.2}%, R²={:.3} (n={})",
            self.mae, self.rmse, self.smape, self.mape, self.r_squared, self.sample_count
        )
    }
}
