//! Synthetic hourly market history.
//!
//! Lets the service run and train without a grid-operator key: daily and
//! weekly demand shape, wind as a bounded random walk, solar by daylight,
//! and a heavy-tailed price with occasional spikes and rare negative hours.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use tracing::info;

use crate::domain::{floor_to_hour, Observation, StationWeather};
use crate::store::ForecastStore;

const PRICE_CAP: f64 = 999.99;

pub fn synthetic_history(start: DateTime<Utc>, hours: usize, seed: u64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let price_noise = Normal::new(0.0, 4.0).expect("valid normal");
    let demand_noise = Normal::new(0.0, 150.0).expect("valid normal");

    let start = floor_to_hour(start);
    let mut wind_mw: f64 = 900.0;
    let mut history = Vec::with_capacity(hours);

    for i in 0..hours {
        let ts = start + Duration::hours(i as i64);
        let hour = ts.hour() as f64;
        let daily = (2.0 * std::f64::consts::PI * (hour - 7.0) / 24.0).sin();
        let weekend = matches!(ts.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);

        let mut demand = 8800.0 + 1200.0 * daily + demand_noise.sample(&mut rng);
        if weekend {
            demand -= 500.0;
        }

        wind_mw = (wind_mw + rng.gen_range(-120.0..120.0)).clamp(50.0, 1800.0);
        let solar_mw = daylight_factor(hour) * 600.0;
        let hydro_mw = 320.0;
        let gas_mw = (demand - wind_mw - solar_mw - hydro_mw).max(400.0);

        let mut price = 42.0 + 18.0 * daily + (demand - 8800.0) / 120.0
            - wind_mw / 150.0
            + price_noise.sample(&mut rng);
        if rng.gen_bool(0.012) {
            price *= rng.gen_range(4.0..12.0);
        }
        if wind_mw > 1500.0 && demand < 8200.0 && rng.gen_bool(0.3) {
            price = rng.gen_range(-8.0..0.0);
        }
        let price = price.clamp(-15.0, PRICE_CAP);

        let temperature = -8.0
            + 18.0 * seasonal_factor(ts)
            + 4.0 * daily
            + rng.gen_range(-2.0..2.0);

        history.push(Observation {
            timestamp: ts,
            price: Some(price),
            demand_mw: Some(demand),
            generation_by_fuel: HashMap::from([
                ("wind".to_string(), wind_mw),
                ("solar".to_string(), solar_mw),
                ("hydro".to_string(), hydro_mw),
                ("gas".to_string(), gas_mw),
            ]),
            weather_by_station: HashMap::from([
                (
                    "north".to_string(),
                    StationWeather {
                        temperature_c: Some(temperature - 2.0),
                        wind_speed_ms: Some(wind_mw / 120.0),
                        cloud_cover_percent: Some(rng.gen_range(0.0..100.0)),
                    },
                ),
                (
                    "south".to_string(),
                    StationWeather {
                        temperature_c: Some(temperature + 1.5),
                        wind_speed_ms: Some(wind_mw / 140.0),
                        cloud_cover_percent: Some(rng.gen_range(0.0..100.0)),
                    },
                ),
            ]),
            is_valid: true,
        });
    }
    history
}

/// Seed a demo history ending at the most recent full hour, but only when
/// the store is empty.
pub async fn seed_if_empty(store: &dyn ForecastStore, hours: usize) -> Result<usize> {
    if store.latest_observation().await?.is_some() {
        return Ok(0);
    }
    let start = floor_to_hour(Utc::now()) - Duration::hours(hours as i64);
    let history = synthetic_history(start, hours, 42);
    let count = store.upsert_observations(history).await?;
    info!(count, "seeded synthetic observation history");
    Ok(count)
}

fn daylight_factor(hour: f64) -> f64 {
    if (7.0..=19.0).contains(&hour) {
        ((hour - 7.0) / 12.0 * std::f64::consts::PI).sin()
    } else {
        0.0
    }
}

fn seasonal_factor(ts: DateTime<Utc>) -> f64 {
    let day = ts.ordinal0() as f64;
    (2.0 * std::f64::consts::PI * (day - 172.0) / 365.0).cos() * 0.5 + 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_is_hourly_and_reproducible() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = synthetic_history(start, 100, 7);
        let b = synthetic_history(start, 100, 7);

        assert_eq!(a.len(), 100);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.timestamp, y.timestamp);
            assert_eq!(x.price, y.price);
        }
        for pair in a.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::hours(1));
        }
    }

    #[test]
    fn prices_respect_market_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let history = synthetic_history(start, 24 * 90, 11);
        for obs in &history {
            let price = obs.price.unwrap();
            assert!((-15.0..=PRICE_CAP).contains(&price));
            assert!(obs.demand_mw.unwrap() > 0.0);
        }
    }

    #[tokio::test]
    async fn seeding_is_a_no_op_on_a_populated_store() {
        use crate::store::MemoryStore;
        let store = MemoryStore::new();
        let first = seed_if_empty(&store, 48).await.unwrap();
        let second = seed_if_empty(&store, 48).await.unwrap();
        assert_eq!(first, 48);
        assert_eq!(second, 0);
    }
}
