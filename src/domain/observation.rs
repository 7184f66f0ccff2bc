use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Round a timestamp down to the start of its hour.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::hours(1)).unwrap_or(ts)
}

/// One hourly market observation: the settled pool price together with the
/// demand, generation mix and weather readings for that hour. Appended
/// continuously by ingestion; immutable once quality-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Start of the settlement hour, UTC. Unique per record.
    pub timestamp: DateTime<Utc>,
    /// Settled pool price in $/MWh. `None` when the hour has not settled or
    /// the upstream record was incomplete.
    pub price: Option<f64>,
    pub demand_mw: Option<f64>,
    /// MW by fuel, e.g. "wind", "solar", "gas", "hydro", "coal".
    pub generation_by_fuel: HashMap<String, f64>,
    pub weather_by_station: HashMap<String, StationWeather>,
    /// Records failing quality checks are kept but excluded from training
    /// and validation.
    pub is_valid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationWeather {
    pub temperature_c: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub cloud_cover_percent: Option<f64>,
}

impl Observation {
    pub fn generation(&self, fuel: &str) -> Option<f64> {
        self.generation_by_fuel.get(fuel).copied()
    }

    /// Combined wind + solar output, `None` when neither fuel is reported.
    pub fn renewable_generation_mw(&self) -> Option<f64> {
        let wind = self.generation("wind");
        let solar = self.generation("solar");
        match (wind, solar) {
            (None, None) => None,
            (w, s) => Some(w.unwrap_or(0.0) + s.unwrap_or(0.0)),
        }
    }

    /// Mean temperature across reporting stations.
    pub fn mean_temperature_c(&self) -> Option<f64> {
        let temps: Vec<f64> = self
            .weather_by_station
            .values()
            .filter_map(|w| w.temperature_c)
            .collect();
        if temps.is_empty() {
            None
        } else {
            Some(temps.iter().sum::<f64>() / temps.len() as f64)
        }
    }
}
