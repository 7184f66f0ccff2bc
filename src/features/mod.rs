//! Feature engineering over the observation history.
//!
//! Lag features are joined by timestamp so ingestion gaps surface as `None`
//! rather than silently shifting the series; rolling, volatility and
//! momentum windows run over the most recent observations by position, never
//! past the current row. Records are keyed by timestamp and persisted in
//! bounded batches, so recomputation is an idempotent upsert.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::FeatureConfig;
use crate::domain::{floor_to_hour, FeatureRecord, Observation};
use crate::store::ForecastStore;

/// Share of renewable output assumed curtailed when the pool price clears at
/// or below zero.
const CURTAILMENT_SHARE_AT_FLOOR: f64 = 0.25;

pub struct FeatureCalculator {
    cfg: FeatureConfig,
}

impl FeatureCalculator {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self { cfg }
    }

    /// Compute one record per observation and persist them in bounded
    /// batches. A failed batch is logged and skipped; previously committed
    /// batches stay intact and the run keeps moving. Returns the number of
    /// records written.
    pub async fn calculate_and_persist(
        &self,
        store: &dyn ForecastStore,
        fuel_prices: &HashMap<DateTime<Utc>, f64>,
    ) -> Result<usize> {
        let observations = store.all_observations().await?;
        let records = self.compute_all(&observations, fuel_prices);

        let mut written = 0;
        for (offset, batch) in BatchCursor::new(&records, self.cfg.persist_batch_size) {
            match store.upsert_features(batch.to_vec()).await {
                Ok(count) => {
                    written += count;
                    debug!(offset, count, "feature batch committed");
                }
                Err(e) => {
                    warn!(offset, error = %e, "feature batch failed, continuing at next offset");
                }
            }
        }
        Ok(written)
    }

    /// Derive the full engineered record set, one per observation, in
    /// timestamp order.
    pub fn compute_all(
        &self,
        observations: &[Observation],
        fuel_prices: &HashMap<DateTime<Utc>, f64>,
    ) -> Vec<FeatureRecord> {
        let price_by_hour: HashMap<DateTime<Utc>, f64> = observations
            .iter()
            .filter_map(|o| o.price.map(|p| (floor_to_hour(o.timestamp), p)))
            .collect();

        (0..observations.len())
            .map(|i| self.compute_at(observations, i, &price_by_hour, fuel_prices))
            .collect()
    }

    fn compute_at(
        &self,
        observations: &[Observation],
        index: usize,
        price_by_hour: &HashMap<DateTime<Utc>, f64>,
        fuel_prices: &HashMap<DateTime<Utc>, f64>,
    ) -> FeatureRecord {
        let obs = &observations[index];
        let hour = floor_to_hour(obs.timestamp);
        let mut record = FeatureRecord::empty(obs.timestamp);

        record.price_lag_1h = price_by_hour.get(&(hour - Duration::hours(1))).copied();
        record.price_lag_24h = price_by_hour.get(&(hour - Duration::hours(24))).copied();

        record.rolling_mean_1h = rolling_mean(observations, index, 1);
        record.rolling_mean_24h = rolling_mean(observations, index, 24);
        record.volatility_1h = volatility(observations, index, 1);
        record.volatility_24h = volatility(observations, index, self.cfg.volatility_window_hours);
        record.momentum_3h = momentum(observations, index, self.cfg.momentum_window_hours);
        record.momentum_24h = momentum(observations, index, 24);

        record.fuel_price_lag_1d = fuel_lag(fuel_prices, hour, 1);
        record.fuel_price_lag_7d = fuel_lag(fuel_prices, hour, 7);
        record.fuel_price_lag_30d = fuel_lag(fuel_prices, hour, 30);

        record.curtailment_estimate_mw = curtailment_estimate(obs);

        record
    }
}

/// Mean price over the `window` most recent observations up to and including
/// `index`. `None` when no price in the window is known.
fn rolling_mean(observations: &[Observation], index: usize, window: usize) -> Option<f64> {
    let start = index.saturating_sub(window);
    let prices: Vec<f64> = observations[start..=index]
        .iter()
        .filter_map(|o| o.price)
        .collect();
    if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    }
}

/// Sample standard deviation of price over the `window` most recent
/// observations up to and including `index`; uses at most `window + 1`
/// points, fewer at series start. Needs at least two known prices.
pub fn volatility(observations: &[Observation], index: usize, window: usize) -> Option<f64> {
    let start = index.saturating_sub(window);
    let prices: Vec<f64> = observations[start..=index]
        .iter()
        .filter_map(|o| o.price)
        .collect();
    if prices.len() < 2 {
        return None;
    }
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    let variance =
        prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (prices.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Percentage change between the current price and the price `window` steps
/// back, clamped to series start. Zero when the lookback lands on the
/// current index.
pub fn momentum(observations: &[Observation], index: usize, window: usize) -> Option<f64> {
    let lookback = index.saturating_sub(window);
    if lookback == index {
        return Some(0.0);
    }
    let current = observations[index].price?;
    let base = observations[lookback].price?;
    if base.abs() < 1e-9 {
        return None;
    }
    Some((current - base) / base * 100.0)
}

/// Auxiliary series join: timestamps are floored to the hour before lookup,
/// and a missing key yields `None`, never zero.
fn fuel_lag(fuel_prices: &HashMap<DateTime<Utc>, f64>, hour: DateTime<Utc>, days: i64) -> Option<f64> {
    fuel_prices.get(&(hour - Duration::days(days))).copied()
}

fn curtailment_estimate(obs: &Observation) -> Option<f64> {
    let price = obs.price?;
    let renewables = obs.renewable_generation_mw()?;
    if price <= 0.0 {
        Some(renewables * CURTAILMENT_SHARE_AT_FLOOR)
    } else {
        Some(0.0)
    }
}

/// Pages over a slice in fixed-size batches, tracking the offset so callers
/// can commit each page independently and resume after a failed one.
pub struct BatchCursor<'a, T> {
    items: &'a [T],
    batch_size: usize,
    offset: usize,
}

impl<'a, T> BatchCursor<'a, T> {
    pub fn new(items: &'a [T], batch_size: usize) -> Self {
        Self {
            items,
            batch_size: batch_size.max(1),
            offset: 0,
        }
    }
}

impl<'a, T> Iterator for BatchCursor<'a, T> {
    type Item = (usize, &'a [T]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.items.len() {
            return None;
        }
        let start = self.offset;
        let end = (start + self.batch_size).min(self.items.len());
        self.offset = end;
        Some((start, &self.items[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashMap as StdHashMap;

    fn hourly(prices: &[Option<f64>]) -> Vec<Observation> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| Observation {
                timestamp: base + Duration::hours(i as i64),
                price: *price,
                demand_mw: Some(9000.0),
                generation_by_fuel: StdHashMap::from([("wind".to_string(), 400.0)]),
                weather_by_station: StdHashMap::new(),
                is_valid: true,
            })
            .collect()
    }

    fn calc() -> FeatureCalculator {
        FeatureCalculator::new(crate::config::FeatureConfig::default())
    }

    #[test]
    fn flat_series_has_zero_volatility_and_momentum() {
        let observations = hourly(&vec![Some(50.0); 24]);
        assert_eq!(volatility(&observations, 23, 24), Some(0.0));
        assert_eq!(momentum(&observations, 23, 3), Some(0.0));
    }

    #[test]
    fn momentum_is_zero_at_series_start() {
        let observations = hourly(&[Some(50.0), Some(60.0)]);
        assert_eq!(momentum(&observations, 0, 3), Some(0.0));
        // Index 1 looks back to index 0: (60-50)/50.
        let m = momentum(&observations, 1, 3).unwrap();
        assert!((m - 20.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_needs_two_known_prices() {
        let observations = hourly(&[Some(50.0)]);
        assert_eq!(volatility(&observations, 0, 24), None);
    }

    #[test]
    fn lags_join_by_timestamp_not_position() {
        // An ingestion hole between hours 1 and 2 means hour 2's 1h lag is
        // genuinely unknown.
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut observations = hourly(&[Some(40.0), Some(42.0)]);
        observations.push(Observation {
            timestamp: base + Duration::hours(5),
            price: Some(44.0),
            demand_mw: Some(9000.0),
            generation_by_fuel: StdHashMap::new(),
            weather_by_station: StdHashMap::new(),
            is_valid: true,
        });

        let records = calc().compute_all(&observations, &StdHashMap::new());
        assert_eq!(records[1].price_lag_1h, Some(40.0));
        assert_eq!(records[2].price_lag_1h, None);
    }

    #[test]
    fn missing_fuel_price_yields_none_not_zero() {
        let observations = hourly(&[Some(50.0); 3]);
        let records = calc().compute_all(&observations, &StdHashMap::new());
        assert!(records.iter().all(|r| r.fuel_price_lag_1d.is_none()));
    }

    #[test]
    fn fuel_lag_joins_on_floored_hour() {
        let base = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let observations = vec![Observation {
            // Off-hour reading still joins against its hour bucket.
            timestamp: base + Duration::minutes(10),
            price: Some(50.0),
            demand_mw: Some(9000.0),
            generation_by_fuel: StdHashMap::new(),
            weather_by_station: StdHashMap::new(),
            is_valid: true,
        }];
        let fuel = StdHashMap::from([(base - Duration::days(1), 3.2)]);
        let records = calc().compute_all(&observations, &fuel);
        assert_eq!(records[0].fuel_price_lag_1d, Some(3.2));
    }

    #[test]
    fn curtailment_is_estimated_only_at_the_price_floor() {
        let observations = hourly(&[Some(-2.0), Some(50.0)]);
        let records = calc().compute_all(&observations, &StdHashMap::new());
        assert_eq!(records[0].curtailment_estimate_mw, Some(100.0));
        assert_eq!(records[1].curtailment_estimate_mw, Some(0.0));
    }

    #[test]
    fn batch_cursor_pages_with_offsets() {
        let items: Vec<u32> = (0..2500).collect();
        let pages: Vec<(usize, usize)> = BatchCursor::new(&items, 1000)
            .map(|(offset, page)| (offset, page.len()))
            .collect();
        assert_eq!(pages, vec![(0, 1000), (1000, 1000), (2000, 500)]);
    }

    #[tokio::test]
    async fn recomputation_upserts_identical_records() {
        use crate::store::{ForecastStore, MemoryStore};

        let store = MemoryStore::new();
        let observations = hourly(&(0..48).map(|i| Some(40.0 + i as f64)).collect::<Vec<_>>());
        store.upsert_observations(observations).await.unwrap();

        let calc = calc();
        let fuel = StdHashMap::new();
        let first = calc.calculate_and_persist(&store, &fuel).await.unwrap();
        let after_first = store.all_features().await.unwrap();
        let second = calc.calculate_and_persist(&store, &fuel).await.unwrap();
        let after_second = store.all_features().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(after_first.len(), after_second.len());
        for (a, b) in after_first.iter().zip(after_second.iter()) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.price_lag_24h, b.price_lag_24h);
            assert_eq!(a.volatility_24h, b.volatility_24h);
        }
    }

    proptest! {
        /// Truncating the history after hour `i` never changes the record at
        /// `i`: features only ever look backward.
        #[test]
        fn features_never_use_future_observations(
            prices in proptest::collection::vec(1.0f64..200.0, 30..60),
            cut in 25usize..30,
        ) {
            let observations = hourly(&prices.iter().map(|p| Some(*p)).collect::<Vec<_>>());
            let calc = calc();
            let fuel = StdHashMap::new();

            let full = calc.compute_all(&observations, &fuel);
            let truncated = calc.compute_all(&observations[..=cut], &fuel);

            let a = &full[cut];
            let b = &truncated[cut];
            prop_assert_eq!(a.price_lag_1h, b.price_lag_1h);
            prop_assert_eq!(a.price_lag_24h, b.price_lag_24h);
            prop_assert_eq!(a.rolling_mean_24h, b.rolling_mean_24h);
            prop_assert_eq!(a.volatility_24h, b.volatility_24h);
            prop_assert_eq!(a.momentum_3h, b.momentum_3h);
        }
    }
}
