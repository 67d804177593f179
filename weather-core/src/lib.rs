//! Core library for the `weather-ingest` job.
//!
//! This crate defines:
//! - Configuration (defaults, TOML file, environment)
//! - Abstraction over weather providers, with the OpenWeather client
//! - Abstraction over the warehouse sink, with SQLite and in-memory backends
//! - The ingestion pipeline that stages and merges each city's batch
//!
//! It is used by `weather-ingest-cli`, but can also be driven from other
//! binaries or a scheduler.

pub mod config;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod warehouse;

pub use config::{CityConfig, Config, FailurePolicy, Units};
pub use model::{StoredRecord, WeatherRecord};
pub use pipeline::{CityOutcome, CityReport, Pipeline, PipelineError, PipelineSettings, RunReport};
pub use provider::{FetchError, OpenWeatherProvider, WeatherProvider};
pub use warehouse::{
    MemoryWarehouse, MergeStatement, SqliteWarehouse, TableRef, Warehouse, WarehouseError,
    WriteDisposition,
};
