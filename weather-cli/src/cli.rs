use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode, Text};
use std::path::PathBuf;
use weather_core::{
    CityOutcome, Config, FailurePolicy, MemoryWarehouse, OpenWeatherProvider, Pipeline,
    PipelineSettings, RunReport, SqliteWarehouse, Warehouse,
};

use crate::logging::LogFormat;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-ingest", version, about = "Ingest weather history into the warehouse")]
pub struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch the lookback window for each city and merge it into the warehouse.
    Run {
        /// Only ingest these configured cities (repeatable).
        #[arg(long = "city")]
        cities: Vec<String>,

        /// Override the number of days before today to fetch (max 30).
        #[arg(long)]
        lookback_days: Option<u32>,

        /// Stop at the first city whose staging or merge fails.
        #[arg(long)]
        fail_fast: bool,

        /// Merge into a throwaway in-memory warehouse.
        #[arg(long)]
        dry_run: bool,
    },

    /// List the configured cities.
    Cities,

    /// Show stored row counts per city.
    Status,

    /// Interactively write the config file.
    Configure,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let path = self.config.as_deref();

        match self.command {
            Command::Run { cities, lookback_days, fail_fast, dry_run } => {
                let mut config = Config::load_unvalidated(path)?;
                config.retain_cities(&cities)?;
                if let Some(days) = lookback_days {
                    config.lookback_days = days;
                }
                if fail_fast {
                    config.failure_policy = FailurePolicy::Abort;
                }
                config.validate()?;

                let warehouse: Box<dyn Warehouse> = if dry_run {
                    Box::new(MemoryWarehouse::new())
                } else {
                    let root = config.warehouse_root()?;
                    Box::new(SqliteWarehouse::open(&root, &config.project_id).with_context(|| {
                        format!("Failed to open warehouse at {}", root.display())
                    })?)
                };

                let pipeline = Pipeline::new(
                    PipelineSettings::from_config(&config)?,
                    Box::new(OpenWeatherProvider::from_config(&config)),
                    warehouse,
                );

                let started = Utc::now();
                let report = pipeline.run().await?;
                print_report(&report, started);

                if !report.is_success() {
                    bail!(
                        "{} of {} cities failed",
                        report.failed.len(),
                        report.failed.len() + report.completed.len()
                    );
                }
            }
            Command::Cities => {
                let config = Config::load_unvalidated(path)?;
                println!("{:<20} {:>10} {:>11}", "CITY", "LAT", "LON");
                for city in &config.cities {
                    println!("{:<20} {:>10.4} {:>11.4}", city.name, city.lat, city.lon);
                }
            }
            Command::Status => {
                let config = Config::load_unvalidated(path)?;
                let table = config.target_table()?;
                let warehouse = SqliteWarehouse::open(&config.warehouse_root()?, &config.project_id)?;

                let counts = warehouse.row_counts(&table).await?;
                if counts.is_empty() {
                    println!("{table}: no rows yet");
                } else {
                    println!("{table}");
                    for (city, rows) in counts {
                        println!("  {city:<20} {rows:>8}");
                    }
                }
            }
            Command::Configure => configure(path)?,
        }

        Ok(())
    }
}

fn configure(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let mut config = Config::load_file_layer(path)?;

    let api_key = Password::new("OpenWeather API key (leave empty to keep current):")
        .without_confirmation()
        .with_display_mode(PasswordDisplayMode::Masked)
        .prompt()?;
    if !api_key.trim().is_empty() {
        config.api_key = api_key.trim().to_string();
    }

    config.project_id = Text::new("Project id:").with_default(&config.project_id).prompt()?;
    config.dataset = Text::new("Dataset:").with_default(&config.dataset).prompt()?;
    config.table_name = Text::new("Table:").with_default(&config.table_name).prompt()?;

    // Catch bad names now rather than on the first run.
    config.target_table()?;

    let saved = config.save(path)?;
    println!("Configuration saved to {}", saved.display());
    Ok(())
}

fn print_report(report: &RunReport, started: chrono::DateTime<Utc>) {
    let elapsed = Utc::now() - started;

    println!(
        "{:<20} {:>9} {:>8} {:>7} {:>7} {:>9}",
        "CITY", "REQUESTED", "FETCHED", "MISSING", "FAILED", "INSERTED"
    );
    for city in &report.completed {
        let inserted = match city.outcome {
            CityOutcome::Empty => "-".to_string(),
            CityOutcome::Merged { inserted, .. } => inserted.to_string(),
        };
        println!(
            "{:<20} {:>9} {:>8} {:>7} {:>7} {:>9}",
            city.city, city.requested, city.fetched, city.missing, city.failed, inserted
        );
    }
    for err in &report.failed {
        println!("{:<20} error: {err}", err.city());
    }

    println!(
        "Inserted {} rows in {}s (started {})",
        report.inserted(),
        elapsed.num_seconds(),
        started.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_cities_and_flags() {
        let cli = Cli::try_parse_from([
            "weather-ingest",
            "run",
            "--city",
            "Seattle",
            "--city",
            "San Francisco",
            "--lookback-days",
            "7",
            "--fail-fast",
            "--log-format",
            "json",
        ])
        .expect("arguments should parse");

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run { cities, lookback_days, fail_fast, dry_run } => {
                assert_eq!(cities, vec!["Seattle", "San Francisco"]);
                assert_eq!(lookback_days, Some(7));
                assert!(fail_fast);
                assert!(!dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_config_flag_works_after_subcommand() {
        let cli = Cli::try_parse_from(["weather-ingest", "status", "--config", "/tmp/wx.toml"])
            .expect("arguments should parse");

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/wx.toml")));
        assert!(matches!(cli.command, Command::Status));
    }
}
