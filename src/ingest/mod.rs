//! Upstream data sources: the grid operator's settlement feed and an
//! auxiliary fuel-price index.
//!
//! Every call carries an explicit timeout; a timed-out fetch is logged and
//! treated as absent rather than raised, so callers always tolerate partial
//! data. The fuel source degrades to a built-in default table when no API
//! key is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

use crate::config::MarketDataConfig;
use crate::domain::{floor_to_hour, Observation, StationWeather};

/// Short-lived bearer token with an explicit expiry. Owned by the source
/// that needs it; the clock is passed in, so tests can drive expiry.
#[derive(Default)]
pub struct TokenCache {
    inner: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, now: DateTime<Utc>) -> Option<String> {
        let inner = self.inner.lock();
        match &*inner {
            Some((token, expires_at)) if *expires_at > now => Some(token.clone()),
            _ => None,
        }
    }

    pub fn put(&self, token: String, expires_at: DateTime<Utc>) {
        *self.inner.lock() = Some((token, expires_at));
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Observations settled since `since`. An empty result is normal when
    /// the upstream is slow or unreachable.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Observation>>;
}

pub struct HttpMarketDataSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token_cache: TokenCache,
    token_ttl: Duration,
}

impl HttpMarketDataSource {
    pub fn new(cfg: &MarketDataConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pool-price-forecaster/0.2"));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.http_timeout_seconds))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            token_cache: TokenCache::new(),
            token_ttl: Duration::minutes(cfg.token_ttl_minutes),
        })
    }

    /// Exchange the configured API key for a short-lived bearer token,
    /// reusing a cached one until it expires. No key means anonymous access.
    async fn bearer_token(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        if let Some(token) = self.token_cache.get(now) {
            return Ok(Some(token));
        }
        let Some(api_key) = &self.api_key else {
            return Ok(None);
        };

        let resp = self
            .client
            .post(format!("{}/auth/token", self.base_url))
            .json(&serde_json::json!({ "api_key": api_key }))
            .send()
            .await
            .context("token exchange failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("token endpoint returned HTTP {}", resp.status());
        }
        let body: TokenResponse = resp.json().await.context("token JSON parse failed")?;
        self.token_cache.put(body.token.clone(), now + self.token_ttl);
        Ok(Some(body.token))
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Observation>> {
        let token = self.bearer_token(Utc::now()).await?;
        let url = format!(
            "{}/v1/pool-price?since={}",
            self.base_url,
            since.to_rfc3339()
        );
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!("pool price fetch timed out, treating as absent");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).context("pool price GET failed"),
        };
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("pool price API error: HTTP {status}");
        }

        let raw: Vec<RawObservation> = resp.json().await.context("pool price JSON parse failed")?;
        Ok(raw
            .into_iter()
            .map(|r| Observation {
                timestamp: floor_to_hour(r.begin_datetime_utc),
                price: r.pool_price,
                demand_mw: r.demand_mw,
                generation_by_fuel: r.generation_by_fuel,
                weather_by_station: r.weather_by_station,
                is_valid: true,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    begin_datetime_utc: DateTime<Utc>,
    pool_price: Option<f64>,
    demand_mw: Option<f64>,
    #[serde(default)]
    generation_by_fuel: HashMap<String, f64>,
    #[serde(default)]
    weather_by_station: HashMap<String, StationWeather>,
}

#[async_trait]
pub trait FuelPriceSource: Send + Sync {
    async fn hourly_prices(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<DateTime<Utc>, f64>>;
}

/// Seasonal gas price defaults in $/GJ, January first. Used whenever the
/// paid index is not configured or unreachable.
static DEFAULT_FUEL_PRICES: Lazy<[f64; 12]> = Lazy::new(|| {
    [3.8, 3.6, 3.1, 2.6, 2.3, 2.2, 2.4, 2.5, 2.7, 3.0, 3.4, 3.9]
});

pub struct HttpFuelPriceSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFuelPriceSource {
    pub fn new(cfg: &MarketDataConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.http_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.fuel_price_url.trim_end_matches('/').to_string(),
            api_key: cfg.fuel_price_api_key.clone(),
        })
    }

    async fn fetch(
        &self,
        api_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<DateTime<Utc>, f64>> {
        let url = format!(
            "{}/v1/gas-price?start={}&end={}",
            self.base_url,
            start.to_rfc3339(),
            end.to_rfc3339()
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .context("fuel price GET failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("fuel price API error: HTTP {}", resp.status());
        }
        let raw: Vec<RawFuelPrice> = resp.json().await.context("fuel price JSON parse failed")?;
        Ok(raw
            .into_iter()
            .map(|r| (floor_to_hour(r.timestamp), r.price))
            .collect())
    }
}

#[async_trait]
impl FuelPriceSource for HttpFuelPriceSource {
    async fn hourly_prices(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<DateTime<Utc>, f64>> {
        let Some(api_key) = &self.api_key else {
            warn!("no fuel price API key configured, using default price table");
            return Ok(default_fuel_prices(start, end));
        };
        match self.fetch(api_key, start, end).await {
            Ok(prices) => Ok(prices),
            Err(e) => {
                warn!(error = %e, "fuel price fetch failed, using default price table");
                Ok(default_fuel_prices(start, end))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFuelPrice {
    timestamp: DateTime<Utc>,
    price: f64,
}

/// Expand the monthly default table into hourly entries over `[start, end)`.
pub fn default_fuel_prices(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> HashMap<DateTime<Utc>, f64> {
    let mut prices = HashMap::new();
    let mut ts = floor_to_hour(start);
    while ts < end {
        let month_index = (ts.month0()) as usize;
        prices.insert(ts, DEFAULT_FUEL_PRICES[month_index]);
        ts += Duration::hours(1);
    }
    prices
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg_for(base_url: String, api_key: Option<String>) -> MarketDataConfig {
        MarketDataConfig {
            base_url: base_url.clone(),
            api_key,
            fuel_price_url: base_url,
            fuel_price_api_key: None,
            ..Default::default()
        }
    }

    #[test]
    fn token_cache_expires_with_the_injected_clock() {
        let cache = TokenCache::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        cache.put("abc".to_string(), now + Duration::minutes(55));

        assert_eq!(cache.get(now), Some("abc".to_string()));
        assert_eq!(cache.get(now + Duration::minutes(54)), Some("abc".to_string()));
        assert_eq!(cache.get(now + Duration::minutes(55)), None);

        cache.clear();
        assert_eq!(cache.get(now), None);
    }

    #[tokio::test]
    async fn fetch_parses_upstream_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pool-price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "begin_datetime_utc": "2024-03-01T10:00:00Z",
                    "pool_price": 47.5,
                    "demand_mw": 9600.0,
                    "generation_by_fuel": {"wind": 820.0}
                },
                {
                    "begin_datetime_utc": "2024-03-01T11:00:00Z",
                    "pool_price": null,
                    "demand_mw": 9550.0
                }
            ])))
            .mount(&server)
            .await;

        let source = HttpMarketDataSource::new(&cfg_for(server.uri(), None)).unwrap();
        let observations = source
            .fetch_since(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();

        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].price, Some(47.5));
        assert_eq!(observations[0].generation("wind"), Some(820.0));
        // An unsettled hour arrives with a null price, not zero.
        assert_eq!(observations[1].price, None);
    }

    #[tokio::test]
    async fn api_key_is_exchanged_once_and_the_token_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/pool-price"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let source =
            HttpMarketDataSource::new(&cfg_for(server.uri(), Some("key".to_string()))).unwrap();
        source.fetch_since(Utc::now()).await.unwrap();
        source.fetch_since(Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn upstream_error_is_an_error_not_empty_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pool-price"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let source = HttpMarketDataSource::new(&cfg_for(server.uri(), None)).unwrap();
        assert!(source.fetch_since(Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn missing_fuel_key_degrades_to_the_default_table() {
        let cfg = cfg_for("http://unused.invalid".to_string(), None);
        let source = HttpFuelPriceSource::new(&cfg).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let prices = source
            .hourly_prices(start, start + Duration::hours(48))
            .await
            .unwrap();

        assert_eq!(prices.len(), 48);
        assert_eq!(prices[&start], 3.8);
    }

    #[test]
    fn default_table_follows_the_calendar_month() {
        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let prices = default_fuel_prices(june, june + Duration::hours(2));
        assert_eq!(prices[&june], 2.2);
    }
}
