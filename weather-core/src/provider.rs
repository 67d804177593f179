use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::{config::CityConfig, model::WeatherRecord};

pub mod openweather;

pub use openweather::OpenWeatherProvider;

/// Why a single fetch produced no record.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to weather provider failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("weather provider returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("failed to parse weather provider response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed sample: {0}")]
    Malformed(&'static str),
    #[error("day offset {offset} is outside the lookback window 0..={max}")]
    OffsetOutOfRange { offset: u32, max: u32 },
}

#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    /// Fetch the sample for `city` at `at`.
    ///
    /// `Ok(None)` means the provider answered but had no sample for that time.
    async fn historical(
        &self,
        city: &CityConfig,
        at: DateTime<Utc>,
    ) -> Result<Option<WeatherRecord>, FetchError>;
}
