//! The ingestion pipeline.
//!
//! For every configured city the pipeline fetches one sample per day over the
//! lookback window, stages the batch in a per-city scratch table, merges it
//! into the permanent table on `(timestamp, city)` and drops the scratch
//! table again. Already-stored keys are never touched, so repeated runs are
//! idempotent.

use chrono::{Duration as ChronoDuration, SubsecRound, Utc};
use std::{collections::HashSet, time::Duration};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    config::{CityConfig, Config, FailurePolicy},
    model::WeatherRecord,
    provider::{FetchError, WeatherProvider},
    warehouse::{MergeStatement, TableRef, Warehouse, WarehouseError, WriteDisposition},
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to stage {city} batch into {table}: {source}")]
    Stage { city: String, table: String, source: WarehouseError },
    #[error("failed to merge {city} batch into {table}: {source}")]
    Merge { city: String, table: String, source: WarehouseError },
    #[error("failed to drop staging table {table} for {city}: {source}")]
    Cleanup { city: String, table: String, source: WarehouseError },
}

impl PipelineError {
    pub fn city(&self) -> &str {
        match self {
            PipelineError::Stage { city, .. }
            | PipelineError::Merge { city, .. }
            | PipelineError::Cleanup { city, .. } => city,
        }
    }
}

/// Settings the pipeline needs from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target: TableRef,
    pub cities: Vec<CityConfig>,
    pub lookback_days: u32,
    pub rate_limit_delay: Duration,
    pub failure_policy: FailurePolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            target: config.target_table()?,
            cities: config.cities.clone(),
            lookback_days: config.lookback_days,
            rate_limit_delay: config.rate_limit_delay(),
            failure_policy: config.failure_policy,
        })
    }
}

/// What happened to a city's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CityOutcome {
    /// Nothing was fetched, so nothing was staged or merged.
    Empty,
    Merged { staged: u64, inserted: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityReport {
    pub city: String,
    pub requested: u32,
    pub fetched: usize,
    /// Days the provider answered without a sample.
    pub missing: usize,
    pub failed: usize,
    pub outcome: CityOutcome,
}

impl CityReport {
    pub fn inserted(&self) -> u64 {
        match self.outcome {
            CityOutcome::Empty => 0,
            CityOutcome::Merged { inserted, .. } => inserted,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<CityReport>,
    pub failed: Vec<PipelineError>,
}

impl RunReport {
    pub fn inserted(&self) -> u64 {
        self.completed.iter().map(CityReport::inserted).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A city's fetched records plus tallies of the days that produced nothing.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<WeatherRecord>,
    pub requested: u32,
    pub missing: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct Pipeline {
    settings: PipelineSettings,
    provider: Box<dyn WeatherProvider>,
    warehouse: Box<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        provider: Box<dyn WeatherProvider>,
        warehouse: Box<dyn Warehouse>,
    ) -> Self {
        Self { settings, provider, warehouse }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Fetch the sample for `city` at `now - day_offset` days, then wait out
    /// the rate-limit delay whatever the outcome.
    pub async fn fetch_day(
        &self,
        city: &CityConfig,
        day_offset: u32,
    ) -> Result<Option<WeatherRecord>, FetchError> {
        if day_offset > self.settings.lookback_days {
            return Err(FetchError::OffsetOutOfRange {
                offset: day_offset,
                max: self.settings.lookback_days,
            });
        }

        let at = Utc::now() - ChronoDuration::days(i64::from(day_offset));
        let result = self.provider.historical(city, at).await;

        if !self.settings.rate_limit_delay.is_zero() {
            tokio::time::sleep(self.settings.rate_limit_delay).await;
        }

        result
    }

    /// Fetch every offset in the window, keeping what succeeded.
    pub async fn collect_batch(&self, city: &CityConfig) -> Batch {
        let mut batch = Batch::default();
        let mut seen = HashSet::new();

        for offset in 0..=self.settings.lookback_days {
            batch.requested += 1;

            match self.fetch_day(city, offset).await {
                Ok(Some(record)) => {
                    if seen.insert(record.timestamp) {
                        batch.records.push(record);
                    } else {
                        debug!(offset, timestamp = %record.timestamp, "duplicate sample dropped");
                    }
                }
                Ok(None) => {
                    batch.missing += 1;
                    debug!(offset, "no sample in provider response");
                }
                Err(err) => {
                    batch.failed += 1;
                    warn!(offset, error = %err, "fetch failed, skipping day");
                }
            }
        }

        batch
    }

    /// Fetch, stage, merge and clean up one city.
    pub async fn run_city(&self, city: &CityConfig) -> Result<CityReport, PipelineError> {
        let span = info_span!("city", city = %city.name);
        self.run_city_inner(city).instrument(span).await
    }

    async fn run_city_inner(&self, city: &CityConfig) -> Result<CityReport, PipelineError> {
        info!(days = self.settings.lookback_days + 1, "fetching");
        let batch = self.collect_batch(city).await;

        let mut report = CityReport {
            city: city.name.clone(),
            requested: batch.requested,
            fetched: batch.records.len(),
            missing: batch.missing,
            failed: batch.failed,
            outcome: CityOutcome::Empty,
        };

        if batch.records.is_empty() {
            info!(failed = batch.failed, missing = batch.missing, "no records fetched, nothing to merge");
            return Ok(report);
        }

        let target = &self.settings.target;
        let staging = target.staging_for(&city.name).map_err(|source| PipelineError::Stage {
            city: city.name.clone(),
            table: target.to_string(),
            source,
        })?;

        let merged = self.stage_and_merge(city, &batch.records, &staging).await;

        // Staging is scratch space: drop it whether or not the merge went through.
        let cleanup = self.warehouse.delete_table(&staging, true).await;

        let (staged, inserted) = match (merged, cleanup) {
            (Ok(counts), Ok(())) => counts,
            (Ok(_), Err(source)) => {
                return Err(PipelineError::Cleanup {
                    city: city.name.clone(),
                    table: staging.to_string(),
                    source,
                });
            }
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(table = %staging, error = %cleanup_err, "staging table left behind");
                }
                return Err(err);
            }
        };

        report.outcome = CityOutcome::Merged { staged, inserted };
        info!(
            fetched = report.fetched,
            failed = report.failed,
            missing = report.missing,
            inserted,
            "merged"
        );
        Ok(report)
    }

    async fn stage_and_merge(
        &self,
        city: &CityConfig,
        records: &[WeatherRecord],
        staging: &TableRef,
    ) -> Result<(u64, u64), PipelineError> {
        let target = &self.settings.target;
        let stage_err = |table: &TableRef, source: WarehouseError| PipelineError::Stage {
            city: city.name.clone(),
            table: table.to_string(),
            source,
        };

        self.warehouse.ensure_table(target).await.map_err(|e| stage_err(target, e))?;
        let staged = self
            .warehouse
            .load(records, staging, WriteDisposition::Truncate)
            .await
            .map_err(|e| stage_err(staging, e))?;

        let statement = MergeStatement {
            target: target.clone(),
            source: staging.clone(),
            ingested_at: Utc::now().trunc_subsecs(0),
        };
        debug!(sql = %statement.to_sql(), "running merge");

        let inserted = self.warehouse.merge(&statement).await.map_err(|source| {
            PipelineError::Merge { city: city.name.clone(), table: target.to_string(), source }
        })?;

        Ok((staged, inserted))
    }

    /// Process every configured city in order, applying the failure policy.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();

        for city in &self.settings.cities {
            match self.run_city(city).await {
                Ok(city_report) => report.completed.push(city_report),
                Err(err) => {
                    error!(city = %city.name, error = %err, "city failed");
                    match self.settings.failure_policy {
                        FailurePolicy::Abort => return Err(err),
                        FailurePolicy::Continue => report.failed.push(err),
                    }
                }
            }
        }

        info!(
            cities = report.completed.len(),
            failed = report.failed.len(),
            inserted = report.inserted(),
            "run finished"
        );
        Ok(report)
    }
}
