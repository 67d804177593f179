use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observation for one city, as produced by a provider.
///
/// `(timestamp, city)` is the natural key: the permanent table never holds
/// two records with the same pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub temp: f64,
    pub humidity: u8,
    pub weather_description: String,
    pub wind_speed: f64,
}

impl WeatherRecord {
    pub fn key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.city.as_str())
    }
}

/// A record as it sits in a warehouse table.
///
/// Staged rows have no `ingestion_timestamp`; the merge assigns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: WeatherRecord,
    pub ingestion_timestamp: Option<DateTime<Utc>>,
}

/// Format used for timestamps persisted as text (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
