//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - initializes logging
//! - parses CLI arguments
//! - loads config, secrets, and the field-mapping table
//! - builds the `RunContext` and dispatches to the pipeline
//! - prints the end-of-run summary

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, CommonArgs, HistoricArgs, LiveArgs};
use crate::config::{self, AppConfig};
use crate::data::{ApiClient, StoreClient, StoreParams};
use crate::domain::{Mode, RunContext};
use crate::error::AppError;
use crate::mapping::FieldMapping;
use crate::report;

pub mod pipeline;

use pipeline::{date_range, Pipeline};

/// Entry point for the `bfi` binary.
pub fn run() -> Result<(), AppError> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Daily(args) => {
            // Scheduled mode: always the previous day.
            let yesterday = Utc::now().date_naive() - Duration::days(1);
            run_batch(Mode::Daily, vec![yesterday], args.range, args.delay, &args.common)
        }
        Command::Historic(args) => {
            let dates = historic_dates(&args)?;
            run_batch(Mode::Historic, dates, args.range, args.delay, &args.common)
        }
        Command::Live(args) => run_live(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolve the inclusive date list for a historic invocation.
fn historic_dates(args: &HistoricArgs) -> Result<Vec<NaiveDate>, AppError> {
    if let Some(date) = args.date {
        return Ok(vec![date]);
    }
    match (args.start_date, args.end_date) {
        (Some(start), Some(end)) => {
            if start > end {
                return Err(AppError::usage(format!(
                    "--start-date {start} is after --end-date {end}."
                )));
            }
            Ok(date_range(start, end))
        }
        _ => Err(AppError::usage(
            "Historic mode needs --date or --start-date/--end-date.",
        )),
    }
}

fn run_batch(
    mode: Mode,
    dates: Vec<NaiveDate>,
    range: u8,
    delay: u64,
    common: &CommonArgs,
) -> Result<(), AppError> {
    let (ctx, mapping, store) = prepare(mode, dates, range, delay, 10, common)?;
    let source = ApiClient::from_env()?;
    let pipeline = Pipeline::new(&source, store.as_ref(), &mapping, &ctx)?;
    let summary = pipeline.run_dates()?;
    println!("{}", report::format_run_summary(&summary, &ctx));
    Ok(())
}

fn run_live(args: LiveArgs) -> Result<(), AppError> {
    let (ctx, mapping, store) = prepare(Mode::Live, Vec::new(), 1, 0, args.cadence, &args.common)?;
    let source = ApiClient::from_env()?;
    let pipeline = Pipeline::new(&source, store.as_ref(), &mapping, &ctx)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .map_err(|e| AppError::usage(format!("Failed to install signal handler: {e}")))?;

    let summary = pipeline.run_live(&cancel)?;
    println!("{}", report::format_live_summary(&summary));
    Ok(())
}

/// Load config artifacts and fold CLI overrides into an immutable context.
fn prepare(
    mode: Mode,
    dates: Vec<NaiveDate>,
    range: u8,
    delay: u64,
    cadence: u64,
    common: &CommonArgs,
) -> Result<(RunContext, FieldMapping, Option<StoreClient>), AppError> {
    let app_config = AppConfig::from_yaml_file(&common.config)?;
    let mapping = FieldMapping::from_yaml_file(&common.mappings)?;

    let variables = common
        .variables
        .as_deref()
        .map(config::load_variables)
        .transpose()?;

    let store = if common.write {
        let token = config::store_token_from_env()?;
        let params = StoreParams {
            host: common
                .db_host
                .clone()
                .unwrap_or_else(|| app_config.store.host.clone()),
            org: common
                .db_org
                .clone()
                .unwrap_or_else(|| app_config.store.org.clone()),
            bucket: common
                .db_bucket
                .clone()
                .unwrap_or_else(|| app_config.store.bucket.clone()),
            token,
        };
        Some(StoreClient::new(params))
    } else {
        None
    };

    let ctx = RunContext {
        mode,
        dates,
        range,
        write: common.write,
        override_existing: common.override_existing,
        retain_file: common.retain_file,
        delay_secs: delay,
        cadence_secs: cadence,
        variables,
        source_utc_offset_minutes: app_config.source_utc_offset_minutes,
        tags: app_config.tags.clone(),
        output_dir: common
            .out_dir
            .clone()
            .unwrap_or_else(|| app_config.output_dir.clone()),
        runs_file: app_config.runs_file.clone(),
    };

    Ok((ctx, mapping, store))
}
