//! Hourly weather per location cluster from the Open-Meteo forecast API.
//!
//! Open-Meteo returns local wall-clock times without an offset. The adapter requests them
//! in the source clock's zone, so the pipeline reads them back in the zone they were
//! written in.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use recon_core::{FieldValue, Fields, KeySpec, NumericRule, RuleSet, SourceClock};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{json_at, AdapterError, FetchContext, RecordProfile, Snapshot, SnapshotFetcher};

const HOURLY_VARIABLES: [(&str, &str); 5] = [
    ("temperature_2m", "temp_c"),
    ("wind_speed_10m", "wind_kph"),
    ("wind_direction_10m", "wind_direction"),
    ("direct_radiation", "solar_rad"),
    ("cloud_cover", "cloud_cover"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationKind {
    Wind,
    Solar,
    Demand,
    Mixed,
}

impl LocationKind {
    fn as_str(self) -> &'static str {
        match self {
            LocationKind::Wind => "WIND",
            LocationKind::Solar => "SOLAR",
            LocationKind::Demand => "DEMAND",
            LocationKind::Mixed => "MIXED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_kind")]
    pub kind: LocationKind,
}

fn default_kind() -> LocationKind {
    LocationKind::Mixed
}

impl Location {
    fn new(name: &str, lat: f64, lon: f64, kind: LocationKind) -> Self {
        Self {
            name: name.into(),
            lat,
            lon,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub forecast_url: String,
    pub locations: Vec<Location>,
    /// Days before today to include, today always included.
    pub past_days: u32,
    pub table: String,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        use LocationKind::*;
        Self {
            forecast_url: "https://api.open-meteo.com/v1/forecast".into(),
            locations: vec![
                Location::new("Darlowo", 54.42, 16.41, Wind),
                Location::new("Slupsk", 54.46, 17.02, Wind),
                Location::new("Konin", 52.22, 18.25, Solar),
                Location::new("Zamosc", 50.72, 23.25, Solar),
                Location::new("Warszawa", 52.22, 21.01, Demand),
                Location::new("Katowice", 50.26, 19.02, Demand),
            ],
            past_days: 0,
            table: "weather_hourly".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeatherAdapter {
    source_id: String,
    clock: SourceClock,
    settings: WeatherSettings,
}

impl WeatherAdapter {
    pub fn new(source_id: impl Into<String>, clock: SourceClock, settings: WeatherSettings) -> Self {
        Self {
            source_id: source_id.into(),
            clock,
            settings,
        }
    }

    pub fn query(&self, location: &Location, start: NaiveDate, end: NaiveDate) -> Vec<(&'static str, String)> {
        let hourly = HOURLY_VARIABLES
            .iter()
            .map(|(api, _)| *api)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            ("latitude", location.lat.to_string()),
            ("longitude", location.lon.to_string()),
            ("start_date", start.format("%Y-%m-%d").to_string()),
            ("end_date", end.format("%Y-%m-%d").to_string()),
            ("hourly", hourly),
            ("timezone", self.clock.tz().name().to_string()),
        ]
    }
}

#[async_trait]
impl SnapshotFetcher for WeatherAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        let rules = RuleSet {
            required: vec!["location".into(), "timestamp".into()],
            numeric: vec![
                NumericRule::between("temp_c", -60.0, 60.0),
                NumericRule {
                    min: Some(0.0),
                    ..NumericRule::new("wind_kph")
                },
                NumericRule::between("wind_direction", 0.0, 360.0),
                NumericRule {
                    min: Some(0.0),
                    ..NumericRule::new("solar_rad")
                },
                NumericRule::between("cloud_cover", 0.0, 100.0),
            ],
            ordering: Vec::new(),
        };
        let table = TableSpec::new(self.settings.table.clone())
            .column("location", ColumnKind::Text)
            .column("location_type", ColumnKind::Text)
            .column("timestamp", ColumnKind::Timestamp)
            .column("lat", ColumnKind::Float)
            .column("lon", ColumnKind::Float)
            .column("temp_c", ColumnKind::Float)
            .column("wind_kph", ColumnKind::Float)
            .column("wind_direction", ColumnKind::Float)
            .column("solar_rad", ColumnKind::Float)
            .column("cloud_cover", ColumnKind::Float);
        RecordProfile {
            key: KeySpec::composite(["location", "timestamp"]),
            rules,
            timestamp_field: Some("timestamp".into()),
            table,
        }
    }

    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let today = ctx.fetched_at.with_timezone(&self.clock.tz()).date_naive();
        let start = today - Duration::days(i64::from(self.settings.past_days));

        let mut parts = Vec::with_capacity(self.settings.locations.len());
        for location in &self.settings.locations {
            let query = self.query(location, start, today);
            let result = match http
                .get_json::<JsonValue>(&self.source_id, &self.settings.forecast_url, &query)
                .await
            {
                Ok(body) => parse_hourly(location, &body),
                Err(err) => Err(err.into()),
            };
            match &result {
                Ok(rows) => info!(location = %location.name, rows = rows.len(), "fetched weather"),
                Err(err) => warn!(location = %location.name, error = %err, "weather location failed"),
            }
            parts.push((location.name.clone(), result));
        }
        Snapshot::from_parts(parts)
    }
}

pub fn parse_hourly(location: &Location, body: &JsonValue) -> Result<Vec<Fields>, AdapterError> {
    let times = json_at(body, &["hourly", "time"])
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::parse(format!("weather for {}", location.name), "missing hourly.time"))?;

    let mut rows = Vec::with_capacity(times.len());
    for (index, time) in times.iter().enumerate() {
        let Some(time) = time.as_str() else {
            continue;
        };
        let mut fields = Fields::new();
        fields.insert("location".into(), FieldValue::text(&location.name));
        fields.insert("location_type".into(), FieldValue::text(location.kind.as_str()));
        fields.insert("timestamp".into(), FieldValue::text(time));
        fields.insert("lat".into(), FieldValue::Number(location.lat));
        fields.insert("lon".into(), FieldValue::Number(location.lon));
        for (api, field) in HOURLY_VARIABLES {
            let value = json_at(body, &["hourly", api])
                .and_then(|series| series.get(index))
                .and_then(JsonValue::as_f64);
            fields.insert(field.into(), value.into());
        }
        rows.push(fields);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use recon_core::{derive_key, normalize_timestamp, validate, NormalizedTime, SourceClock};
    use serde_json::json;

    use super::*;

    fn konin() -> Location {
        Location::new("Konin", 52.22, 18.25, LocationKind::Solar)
    }

    #[test]
    fn hourly_arrays_are_zipped_into_rows() {
        let body = json!({
            "hourly": {
                "time": ["2025-06-15T13:00", "2025-06-15T14:00"],
                "temperature_2m": [21.5, 22.0],
                "wind_speed_10m": [12.0, 14.5],
                "direct_radiation": [640.0, null],
                "cloud_cover": [10, 20]
            }
        });
        let rows = parse_hourly(&konin(), &body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("location_type"), Some(&FieldValue::text("SOLAR")));
        assert_eq!(rows[0].get("temp_c"), Some(&FieldValue::Number(21.5)));
        assert_eq!(rows[1].get("solar_rad"), Some(&FieldValue::Null));
        // Series missing from the response become nulls.
        assert_eq!(rows[0].get("wind_direction"), Some(&FieldValue::Null));
    }

    #[test]
    fn local_times_key_to_utc_bars() {
        let body = json!({"hourly": {"time": ["2025-06-15T14:00"], "cloud_cover": [30]}});
        let rows = parse_hourly(&konin(), &body).unwrap();
        let clock = SourceClock::parse("Europe/Warsaw").unwrap();
        let adapter = WeatherAdapter::new("weather", clock, WeatherSettings::default());
        let profile = adapter.profile();
        assert!(validate(&rows[0], &profile.rules).is_accepted());

        let raw = rows[0].get("timestamp").and_then(FieldValue::as_str).unwrap();
        let NormalizedTime::Utc(ts) = normalize_timestamp(raw, &clock) else {
            panic!("timestamp must parse");
        };
        let mut keyed = rows[0].clone();
        keyed.insert("timestamp".into(), FieldValue::text(recon_core::format_utc(ts)));
        let key = derive_key(&keyed, &profile.key).unwrap();
        assert_eq!(key.as_str(), "Konin|2025-06-15T12:00:00Z");
    }

    #[test]
    fn request_zone_follows_the_source_clock() {
        let day = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        for zone in ["UTC", "Europe/Warsaw", "America/New_York"] {
            let clock = SourceClock::parse(zone).unwrap();
            let adapter = WeatherAdapter::new("weather", clock, WeatherSettings::default());
            let query = adapter.query(&konin(), day, day);
            assert!(query.contains(&("timezone", zone.to_string())), "{zone}: {query:?}");
        }
    }

    #[test]
    fn missing_time_axis_is_a_parse_error() {
        assert!(parse_hourly(&konin(), &json!({"hourly": {}})).is_err());
    }

    #[test]
    fn locations_deserialize_with_default_kind() {
        let location: Location =
            serde_json::from_value(json!({"name": "Lodz", "lat": 51.75, "lon": 19.45})).unwrap();
        assert_eq!(location.kind, LocationKind::Mixed);
    }
}
