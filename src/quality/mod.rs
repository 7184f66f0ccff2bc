//! Data quality analysis over the observation history.
//!
//! Pure read over the store's observations and features plus a single report
//! write by the caller; source data is never mutated.

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::QualityConfig;
use crate::domain::{FeatureRecord, Observation, ENHANCED_FEATURES};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub created_at: DateTime<Utc>,
    /// Unweighted mean of the six sub-scores, 0..100.
    pub overall_quality_score: f64,
    pub missing_data: MissingDataAnalysis,
    pub outliers: OutlierAnalysis,
    pub recent_completeness_percent: f64,
    /// Percent of feature rows carrying each enhanced feature.
    pub feature_coverage_percent: HashMap<String, f64>,
    pub negative_value_rate_percent: f64,
    pub continuity_score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingDataAnalysis {
    /// Null rate in percent per critical field.
    pub rates_percent: HashMap<String, f64>,
    pub worst_field: String,
    pub worst_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierAnalysis {
    pub q1: f64,
    pub q3: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub outlier_count: usize,
    pub outlier_rate_percent: f64,
}

pub struct DataQualityAnalyzer {
    cfg: QualityConfig,
}

impl DataQualityAnalyzer {
    pub fn new(cfg: QualityConfig) -> Self {
        Self { cfg }
    }

    pub fn analyze(
        &self,
        now: DateTime<Utc>,
        observations: &[Observation],
        features: &[FeatureRecord],
    ) -> QualityReport {
        if observations.is_empty() {
            return QualityReport {
                created_at: now,
                overall_quality_score: 0.0,
                missing_data: MissingDataAnalysis {
                    rates_percent: HashMap::new(),
                    worst_field: "price".to_string(),
                    worst_rate_percent: 100.0,
                },
                outliers: OutlierAnalysis {
                    q1: 0.0,
                    q3: 0.0,
                    lower_bound: 0.0,
                    upper_bound: 0.0,
                    outlier_count: 0,
                    outlier_rate_percent: 0.0,
                },
                recent_completeness_percent: 0.0,
                feature_coverage_percent: HashMap::new(),
                negative_value_rate_percent: 0.0,
                continuity_score: 0.0,
                recommendations: vec!["No observations ingested yet; nothing to analyze".to_string()],
            };
        }

        let missing_data = self.missing_rates(observations);
        let outliers = self.price_outliers(observations);
        let recent_completeness = self.recent_completeness(now, observations, features);
        let coverage = feature_coverage(features);
        let mean_coverage = if coverage.is_empty() {
            0.0
        } else {
            coverage.values().sum::<f64>() / coverage.len() as f64
        };
        let negative_rate = negative_value_rate(observations);
        let continuity = self.continuity_score(observations);

        let overall = [
            100.0 - missing_data.worst_rate_percent,
            100.0 - outliers.outlier_rate_percent,
            recent_completeness,
            mean_coverage,
            100.0 - negative_rate,
            continuity,
        ]
        .iter()
        .sum::<f64>()
            / 6.0;

        let recommendations =
            self.recommendations(&missing_data, &outliers, recent_completeness, &coverage, continuity);

        QualityReport {
            created_at: now,
            overall_quality_score: overall.clamp(0.0, 100.0),
            missing_data,
            outliers,
            recent_completeness_percent: recent_completeness,
            feature_coverage_percent: coverage,
            negative_value_rate_percent: negative_rate,
            continuity_score: continuity,
            recommendations,
        }
    }

    fn missing_rates(&self, observations: &[Observation]) -> MissingDataAnalysis {
        let n = observations.len() as f64;
        let mut rates = HashMap::new();

        let price_nulls = observations.iter().filter(|o| o.price.is_none()).count();
        let demand_nulls = observations.iter().filter(|o| o.demand_mw.is_none()).count();
        let wind_nulls = observations
            .iter()
            .filter(|o| o.generation("wind").is_none())
            .count();
        let temp_nulls = observations
            .iter()
            .filter(|o| o.mean_temperature_c().is_none())
            .count();

        rates.insert("price".to_string(), price_nulls as f64 / n * 100.0);
        rates.insert("demand_mw".to_string(), demand_nulls as f64 / n * 100.0);
        rates.insert("wind_generation".to_string(), wind_nulls as f64 / n * 100.0);
        rates.insert("temperature".to_string(), temp_nulls as f64 / n * 100.0);

        let (worst_field, worst_rate) = rates
            .iter()
            .max_by_key(|(_, rate)| OrderedFloat(**rate))
            .map(|(field, rate)| (field.clone(), *rate))
            .unwrap_or_else(|| ("price".to_string(), 0.0));

        MissingDataAnalysis {
            rates_percent: rates,
            worst_field,
            worst_rate_percent: worst_rate,
        }
    }

    fn price_outliers(&self, observations: &[Observation]) -> OutlierAnalysis {
        let mut prices: Vec<f64> = observations.iter().filter_map(|o| o.price).collect();
        prices.sort_by_key(|p| OrderedFloat(*p));

        if prices.len() < 4 {
            return OutlierAnalysis {
                q1: 0.0,
                q3: 0.0,
                lower_bound: 0.0,
                upper_bound: 0.0,
                outlier_count: 0,
                outlier_rate_percent: 0.0,
            };
        }

        let q1 = percentile(&prices, 0.25);
        let q3 = percentile(&prices, 0.75);
        let iqr = q3 - q1;
        let lower = q1 - self.cfg.outlier_iqr_multiplier * iqr;
        let upper = q3 + self.cfg.outlier_iqr_multiplier * iqr;
        let outlier_count = prices.iter().filter(|p| **p < lower || **p > upper).count();

        OutlierAnalysis {
            q1,
            q3,
            lower_bound: lower,
            upper_bound: upper,
            outlier_count,
            outlier_rate_percent: outlier_count as f64 / prices.len() as f64 * 100.0,
        }
    }

    /// Fraction of last-N-days records with price, demand, a renewable
    /// generation value and a lag feature all present.
    fn recent_completeness(
        &self,
        now: DateTime<Utc>,
        observations: &[Observation],
        features: &[FeatureRecord],
    ) -> f64 {
        let cutoff = now - Duration::days(self.cfg.recent_window_days);
        let lag_by_ts: HashMap<DateTime<Utc>, bool> = features
            .iter()
            .map(|f| (f.timestamp, f.price_lag_24h.is_some()))
            .collect();

        let recent: Vec<&Observation> = observations
            .iter()
            .filter(|o| o.timestamp >= cutoff)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }

        let complete = recent
            .iter()
            .filter(|o| {
                o.price.is_some()
                    && o.demand_mw.is_some()
                    && o.renewable_generation_mw().is_some()
                    && lag_by_ts.get(&o.timestamp).copied().unwrap_or(false)
            })
            .count();

        complete as f64 / recent.len() as f64 * 100.0
    }

    /// Penalizes gaps larger than the configured maximum between consecutive
    /// observations.
    fn continuity_score(&self, observations: &[Observation]) -> f64 {
        if observations.len() < 2 {
            return 100.0;
        }
        let max_gap_secs = (self.cfg.max_gap_hours * 3600.0) as i64;
        let gaps = observations
            .iter()
            .tuple_windows()
            .filter(|(a, b)| (b.timestamp - a.timestamp).num_seconds() > max_gap_secs)
            .count();
        (100.0 * (1.0 - gaps as f64 / (observations.len() - 1) as f64)).clamp(0.0, 100.0)
    }

    fn recommendations(
        &self,
        missing: &MissingDataAnalysis,
        outliers: &OutlierAnalysis,
        recent_completeness: f64,
        coverage: &HashMap<String, f64>,
        continuity: f64,
    ) -> Vec<String> {
        let mut recs = Vec::new();

        if missing.worst_rate_percent > 10.0 {
            recs.push(format!(
                "Field '{}' is missing in {:.1}% of records; check the upstream feed mapping",
                missing.worst_field, missing.worst_rate_percent
            ));
        }
        if outliers.outlier_rate_percent > 5.0 {
            recs.push(format!(
                "{:.1}% of prices fall outside [{:.1}, {:.1}]; review ingest unit conversions",
                outliers.outlier_rate_percent, outliers.lower_bound, outliers.upper_bound
            ));
        }
        if recent_completeness < self.cfg.completeness_warn_percent {
            recs.push(format!(
                "Recent completeness is {:.1}% (target {:.0}%); recent hours lack price, demand, renewables or lag features",
                recent_completeness, self.cfg.completeness_warn_percent
            ));
        }
        for (name, pct) in coverage {
            if *pct < self.cfg.coverage_warn_percent {
                recs.push(format!(
                    "Feature '{}' covers only {:.1}% of hours; backfill its source series",
                    name, pct
                ));
            }
        }
        if continuity < 95.0 {
            recs.push(format!(
                "Temporal continuity is {:.1}%; hourly ingestion has gaps wider than {:.1}h",
                continuity, self.cfg.max_gap_hours
            ));
        }

        recs.sort();
        recs
    }
}

fn feature_coverage(features: &[FeatureRecord]) -> HashMap<String, f64> {
    let mut coverage = HashMap::new();
    if features.is_empty() {
        return coverage;
    }
    let n = features.len() as f64;
    for name in ENHANCED_FEATURES {
        let present = features.iter().filter(|f| f.feature(name).is_some()).count();
        coverage.insert(name.to_string(), present as f64 / n * 100.0);
    }
    coverage
}

fn negative_value_rate(observations: &[Observation]) -> f64 {
    let impossible = observations
        .iter()
        .filter(|o| {
            o.price.map(|p| p < 0.0).unwrap_or(false)
                || o.demand_mw.map(|d| d < 0.0).unwrap_or(false)
                || o.generation_by_fuel.values().any(|g| *g < 0.0)
        })
        .count();
    impossible as f64 / observations.len() as f64 * 100.0
}

/// Linear-interpolation percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (idx - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn obs(hour: u32, price: Option<f64>) -> Observation {
        Observation {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            price,
            demand_mw: Some(9000.0),
            generation_by_fuel: StdHashMap::from([("wind".to_string(), 500.0)]),
            weather_by_station: StdHashMap::new(),
            is_valid: true,
        }
    }

    fn analyzer() -> DataQualityAnalyzer {
        DataQualityAnalyzer::new(QualityConfig::default())
    }

    #[test]
    fn empty_history_scores_zero_with_a_recommendation() {
        let report = analyzer().analyze(Utc::now(), &[], &[]);
        assert_eq!(report.overall_quality_score, 0.0);
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn missing_price_rate_is_counted() {
        let observations = vec![obs(0, Some(50.0)), obs(1, None), obs(2, Some(52.0)), obs(3, Some(48.0))];
        let report = analyzer().analyze(Utc::now(), &observations, &[]);
        let price_rate = report.missing_data.rates_percent["price"];
        assert!((price_rate - 25.0).abs() < 1e-9);
    }

    #[test]
    fn tukey_fences_use_triple_iqr() {
        // Flat series plus one wild spike: 3x IQR keeps the fence wide but
        // the spike still falls outside it.
        let mut observations: Vec<Observation> =
            (0..20).map(|h| obs(h, Some(50.0 + (h % 4) as f64))).collect();
        observations.push(obs(20, Some(900.0)));
        let report = analyzer().analyze(Utc::now(), &observations, &[]);
        assert_eq!(report.outliers.outlier_count, 1);
        assert!(report.outliers.upper_bound < 900.0);
        assert!(report.outliers.upper_bound > 53.0);
    }

    #[test]
    fn continuity_penalizes_wide_gaps() {
        let mut observations = vec![obs(0, Some(50.0)), obs(1, Some(51.0))];
        // 6 hour hole.
        observations.push(obs(7, Some(52.0)));
        let report = analyzer().analyze(Utc::now(), &observations, &[]);
        assert!(report.continuity_score < 100.0);
    }

    #[test]
    fn negative_demand_counts_as_impossible() {
        let mut bad = obs(0, Some(50.0));
        bad.demand_mw = Some(-100.0);
        let observations = vec![bad, obs(1, Some(51.0))];
        let report = analyzer().analyze(Utc::now(), &observations, &[]);
        assert!((report.negative_value_rate_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&sorted, 0.25) - 1.75).abs() < 1e-9);
        assert!((percentile(&sorted, 0.75) - 3.25).abs() < 1e-9);
    }
}
