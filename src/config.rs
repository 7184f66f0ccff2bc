use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub market_data: MarketDataConfig,
    pub forecast: ForecastConfig,
    pub features: FeatureConfig,
    pub quality: QualityConfig,
    pub validation: ValidationConfig,
    pub retraining: RetrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            enable_cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Poll the upstream grid-operator feed on a schedule. Off by default;
    /// the sim feature seeds a synthetic history instead.
    pub poll_enabled: bool,
    pub poll_interval_minutes: u64,
    pub base_url: String,
    pub api_key: Option<String>,
    pub fuel_price_url: String,
    pub fuel_price_api_key: Option<String>,
    pub http_timeout_seconds: u64,
    pub token_ttl_minutes: i64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            poll_enabled: false,
            poll_interval_minutes: 15,
            base_url: "https://api.gridoperator.example".to_string(),
            api_key: None,
            fuel_price_url: "https://api.fuelindex.example".to_string(),
            fuel_price_api_key: None,
            http_timeout_seconds: 15,
            token_ttl_minutes: 55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub cache_ttl_minutes: i64,
    pub generation_batch_hours: u32,
    pub max_horizon_hours: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: 15,
            generation_batch_hours: 24,
            max_horizon_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub persist_batch_size: usize,
    pub volatility_window_hours: usize,
    pub momentum_window_hours: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            persist_batch_size: 1000,
            volatility_window_hours: 24,
            momentum_window_hours: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Tukey fence multiplier. Spot prices are heavy-tailed, so 3.0 rather
    /// than the conventional 1.5.
    pub outlier_iqr_multiplier: f64,
    pub recent_window_days: i64,
    pub coverage_warn_percent: f64,
    pub completeness_warn_percent: f64,
    pub max_gap_hours: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            outlier_iqr_multiplier: 3.0,
            recent_window_days: 30,
            coverage_warn_percent: 90.0,
            completeness_warn_percent: 95.0,
            max_gap_hours: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub batch_limit: usize,
    pub actual_match_tolerance_minutes: i64,
    pub elevated_threshold: f64,
    pub spike_threshold: f64,
    pub sweep_interval_minutes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            batch_limit: 200,
            actual_match_tolerance_minutes: 30,
            elevated_threshold: 100.0,
            spike_threshold: 500.0,
            sweep_interval_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingConfig {
    pub check_interval_hours: u64,
    pub smape_threshold_percent: f64,
    pub quality_threshold: f64,
    pub max_age_hours: i64,
    pub drift_window_days: i64,
    pub min_training_records: usize,
    pub holdout_ratio: f64,
    pub l2_penalty: f64,
    pub search_l2_grid: Vec<f64>,
}

impl Default for RetrainingConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: 24,
            smape_threshold_percent: 25.0,
            quality_threshold: 70.0,
            max_age_hours: 168,
            drift_window_days: 7,
            min_training_records: 168,
            holdout_ratio: 0.8,
            l2_penalty: 1.0,
            search_l2_grid: vec![0.01, 0.1, 1.0, 10.0, 100.0],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("PPF__").split("__"));
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_config_file() {
        let cfg = Config::default();
        assert_eq!(cfg.forecast.cache_ttl_minutes, 15);
        assert_eq!(cfg.forecast.generation_batch_hours, 24);
        assert_eq!(cfg.features.persist_batch_size, 1000);
        assert!(cfg.server.socket_addr().is_ok());
    }

    #[test]
    fn quality_defaults_use_wide_tukey_fences() {
        let cfg = QualityConfig::default();
        assert_eq!(cfg.outlier_iqr_multiplier, 3.0);
    }
}
