use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::{CityConfig, Config, DEFAULT_API_BASE_URL, Units},
    model::WeatherRecord,
};

use super::{FetchError, WeatherProvider};

const TIMEMACHINE_PATH: &str = "/data/3.0/onecall/timemachine";

/// OpenWeather One Call "timemachine" client.
#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    units: Units,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, units: Units) -> Self {
        Self::with_base_url(api_key, units, DEFAULT_API_BASE_URL)
    }

    pub fn with_base_url(api_key: String, units: Units, base_url: &str) -> Self {
        Self {
            api_key,
            units,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_base_url(config.api_key.clone(), config.units, &config.api_base_url)
    }
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwSample {
    dt: i64,
    temp: f64,
    humidity: u8,
    #[serde(default)]
    weather: Vec<OwWeather>,
    #[serde(default)]
    wind_speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwTimemachineResponse {
    #[serde(default)]
    data: Option<Vec<OwSample>>,
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn historical(
        &self,
        city: &CityConfig,
        at: DateTime<Utc>,
    ) -> Result<Option<WeatherRecord>, FetchError> {
        let url = format!("{}{TIMEMACHINE_PATH}", self.base_url);

        let res = self
            .http
            .get(&url)
            .query(&[
                ("lat", city.lat.to_string()),
                ("lon", city.lon.to_string()),
                ("dt", at.timestamp().to_string()),
                ("appid", self.api_key.clone()),
                ("units", self.units.as_str().to_string()),
            ])
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(FetchError::Status { status, body: truncate_body(&body) });
        }

        let parsed: OwTimemachineResponse = serde_json::from_str(&body)?;

        let Some(sample) = parsed.data.and_then(|data| data.into_iter().next()) else {
            return Ok(None);
        };

        let timestamp = DateTime::from_timestamp(sample.dt, 0)
            .ok_or(FetchError::Malformed("sample time is out of range"))?;

        let weather_description = sample
            .weather
            .into_iter()
            .next()
            .map(|w| w.description)
            .ok_or(FetchError::Malformed("sample has no weather description"))?;

        Ok(Some(WeatherRecord {
            timestamp,
            city: city.name.clone(),
            temp: sample.temp,
            humidity: sample.humidity,
            weather_description,
            wind_speed: sample.wind_speed.unwrap_or(0.0),
        }))
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
