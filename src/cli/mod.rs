//! Command-line parsing for the sensor ingestion pipeline.
//!
//! The goal of this module is to keep **argument parsing** and **command
//! dispatch** separate from the cleaning/point-building code.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "bfi", version, about = "Blast furnace sensor data ingestion pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Backfill the previous day (intended for cron).
    Daily(DailyArgs),
    /// Backfill one date or an inclusive date range.
    Historic(HistoricArgs),
    /// Poll the live API on a fixed cadence until interrupted.
    Live(LiveArgs),
}

/// Options shared by all modes.
#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    /// Write points to the time-series store (staging always happens).
    #[arg(long)]
    pub write: bool,

    /// Overwrite existing points at the same natural key unconditionally.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub override_existing: bool,

    /// Keep (gzip) the staged points file after the run.
    #[arg(long)]
    pub retain_file: bool,

    /// Path to the app config YAML.
    #[arg(long, default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Path to the field mappings YAML.
    #[arg(long, default_value = "config/field_mappings.yaml")]
    pub mappings: PathBuf,

    /// Optional allow-list file: one canonical field name per line.
    #[arg(long)]
    pub variables: Option<PathBuf>,

    /// Store host override (e.g., https://store.example.com:8086).
    #[arg(long)]
    pub db_host: Option<String>,

    /// Store organization override.
    #[arg(long)]
    pub db_org: Option<String>,

    /// Store bucket override.
    #[arg(long)]
    pub db_bucket: Option<String>,

    /// Output directory for staged/retained files.
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

/// Options for the scheduled previous-day backfill.
#[derive(Debug, Args)]
pub struct DailyArgs {
    /// Range parameter forwarded to the daily API.
    #[arg(long, default_value_t = 2)]
    pub range: u8,

    /// Pause between dates, seconds.
    #[arg(long, default_value_t = 120)]
    pub delay: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Options for on-demand historic backfills.
#[derive(Debug, Args)]
pub struct HistoricArgs {
    /// Single date to process (YYYY-MM-DD). Mutually exclusive with
    /// --start-date/--end-date.
    #[arg(long, conflicts_with_all = ["start_date", "end_date"])]
    pub date: Option<NaiveDate>,

    /// First date of an inclusive range (YYYY-MM-DD).
    #[arg(long, requires = "end_date")]
    pub start_date: Option<NaiveDate>,

    /// Last date of an inclusive range (YYYY-MM-DD).
    #[arg(long, requires = "start_date")]
    pub end_date: Option<NaiveDate>,

    /// Range parameter forwarded to the daily API.
    #[arg(long, default_value_t = 2)]
    pub range: u8,

    /// Pause between dates, seconds.
    #[arg(long, default_value_t = 120)]
    pub delay: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Options for the live polling loop.
#[derive(Debug, Args)]
pub struct LiveArgs {
    /// Target interval between ticks, seconds.
    #[arg(long, default_value_t = 10)]
    pub cadence: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}
