//! Binary crate for the `weather-ingest` command-line tool.
//!
//! This crate focuses on:
//! - Parsing CLI arguments
//! - Logging setup
//! - Interactive configuration
//! - Human-friendly run reports

use clap::Parser;

mod cli;
mod logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::Cli::parse();
    logging::init_subscriber(cmd.log_format)?;
    cmd.run().await
}
