//! The run orchestrator: drives fetch -> clean -> build -> gate -> write ->
//! stage across one date, a date range, or a live polling loop.
//!
//! Failure of one unit of work (a date, a tick) is routine, not exceptional:
//! per-unit outcomes are values the caller inspects, and the loops continue
//! past transient failures. Only authentication-class API failures abort a
//! run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::clean;
use crate::data::{DataSource, StoreClient};
use crate::domain::{Point, RunContext};
use crate::error::AppError;
use crate::gate::{should_write, PassThroughCheck};
use crate::mapping::FieldMapping;
use crate::points;
use crate::stage::Stager;
use crate::track::{append_run, RunRecord};

/// Counters for one processed unit of work (a date or a live tick).
#[derive(Debug, Clone, Default)]
pub struct UnitStats {
    pub records: usize,
    pub points: usize,
    pub staged: usize,
    pub written: usize,
    pub rejected: usize,
    pub anomalies: usize,
    pub retained_file: Option<std::path::PathBuf>,
    /// Staging failure for this unit, if any. Staging and store writes are
    /// independent: a staging failure does not block the store write.
    pub staging_error: Option<String>,
}

impl UnitStats {
    pub fn succeeded(&self) -> bool {
        self.staging_error.is_none()
    }
}

/// Outcome for one date of a daily/historic run.
#[derive(Debug, Clone)]
pub struct DateOutcome {
    pub date: NaiveDate,
    pub result: Result<UnitStats, String>,
}

/// All outcomes of a daily/historic run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<DateOutcome>,
}

impl RunSummary {
    pub fn failed_dates(&self) -> Vec<NaiveDate> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.date)
            .collect()
    }

    pub fn totals(&self) -> UnitStats {
        let mut totals = UnitStats::default();
        for outcome in &self.outcomes {
            if let Ok(stats) = &outcome.result {
                totals.records += stats.records;
                totals.points += stats.points;
                totals.staged += stats.staged;
                totals.written += stats.written;
                totals.rejected += stats.rejected;
                totals.anomalies += stats.anomalies;
            }
        }
        totals
    }
}

/// Outcome of a live run (after cancellation).
#[derive(Debug, Clone, Default)]
pub struct LiveSummary {
    pub ticks: usize,
    pub failed_ticks: usize,
    pub points: usize,
    pub anomalies: usize,
}

/// Inclusive date sequence from `start` to `end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        current += chrono::Duration::days(1);
    }
    dates
}

/// Sleep duration until the next cadence boundary: `max(0, cadence - elapsed)`.
pub fn cadence_sleep(cadence: Duration, elapsed: Duration) -> Duration {
    cadence.saturating_sub(elapsed)
}

/// One configured pipeline run. Owns no I/O resources itself; the staging
/// file is scoped to each processed unit.
pub struct Pipeline<'a, S: DataSource> {
    source: &'a S,
    store: Option<&'a StoreClient>,
    mapping: &'a FieldMapping,
    ctx: &'a RunContext,
    source_offset: FixedOffset,
    checker: PassThroughCheck,
    run_id: u32,
}

impl<'a, S: DataSource> Pipeline<'a, S> {
    pub fn new(
        source: &'a S,
        store: Option<&'a StoreClient>,
        mapping: &'a FieldMapping,
        ctx: &'a RunContext,
    ) -> Result<Self, AppError> {
        let source_offset = FixedOffset::east_opt(ctx.source_utc_offset_minutes * 60)
            .ok_or_else(|| {
                AppError::usage(format!(
                    "Invalid source UTC offset: {} minutes.",
                    ctx.source_utc_offset_minutes
                ))
            })?;
        Ok(Self {
            source,
            store,
            mapping,
            ctx,
            source_offset,
            checker: PassThroughCheck::default(),
            run_id: std::process::id(),
        })
    }

    /// Process the pre-computed date list, pausing `delay_secs` between dates.
    ///
    /// A transient failure on one date is recorded and the loop proceeds to
    /// the next date; an authentication-class failure aborts the whole run.
    pub fn run_dates(&self) -> Result<RunSummary, AppError> {
        let mut summary = RunSummary::default();

        for (i, &date) in self.ctx.dates.iter().enumerate() {
            if i > 0 && self.ctx.delay_secs > 0 {
                sleep(Duration::from_secs(self.ctx.delay_secs));
            }
            info!(%date, "processing date");

            let result = match self.process_date(date) {
                Ok(stats) => Ok(stats),
                Err(DateError::Abort(err)) => return Err(err),
                Err(DateError::Failed(message)) => {
                    error!(%date, message = %message, "date failed");
                    Err(message)
                }
            };

            self.track(Some(date), &result);
            summary.outcomes.push(DateOutcome { date, result });
        }

        Ok(summary)
    }

    /// Run the live polling loop until `cancel` is set.
    ///
    /// Cancellation is cooperative: it is checked once per loop boundary, so
    /// an in-flight tick always finishes.
    pub fn run_live(&self, cancel: &AtomicBool) -> Result<LiveSummary, AppError> {
        let cadence = Duration::from_secs(self.ctx.cadence_secs);
        let mut summary = LiveSummary::default();

        while !cancel.load(Ordering::Relaxed) {
            let tick_start = Instant::now();
            let fallback_ts = Utc::now();
            let stem = format!("live_{}", fallback_ts.format("%Y-%m-%d_%H_%M_%S"));

            let result = match self.source.fetch_live() {
                Ok(raw) => match self.process_payload(&raw, fallback_ts, &stem) {
                    Ok(stats) => Ok(stats),
                    Err(err) => Err(err.to_string()),
                },
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => Err(err.to_string()),
            };

            summary.ticks += 1;
            match &result {
                Ok(stats) => {
                    summary.points += stats.points;
                    summary.anomalies += stats.anomalies;
                }
                Err(message) => {
                    warn!(message = %message, "live tick failed");
                    summary.failed_ticks += 1;
                }
            }
            self.track(None, &result);

            if cancel.load(Ordering::Relaxed) {
                break;
            }
            sleep(cadence_sleep(cadence, tick_start.elapsed()));
        }

        info!(
            ticks = summary.ticks,
            failed = summary.failed_ticks,
            "live loop cancelled"
        );
        Ok(summary)
    }

    fn process_date(&self, date: NaiveDate) -> Result<UnitStats, DateError> {
        let raw = self
            .source
            .fetch_date(date, self.ctx.range)
            .map_err(|err| {
                if err.is_fatal() {
                    DateError::Abort(err.into())
                } else {
                    DateError::Failed(err.to_string())
                }
            })?;

        // Records without their own timestamp get the day start, localized at
        // the source offset.
        let fallback_ts = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(self.source_offset).single())
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| DateError::Failed(format!("Cannot resolve day start for {date}.")))?;

        let stem = format!("date_{date}_range{}", self.ctx.range);
        self.process_payload(&raw, fallback_ts, &stem)
            .map_err(|err| DateError::Failed(err.to_string()))
    }

    /// Run one payload through clean -> build -> gate -> stage -> write.
    fn process_payload(
        &self,
        raw: &serde_json::Value,
        fallback_ts: DateTime<Utc>,
        retain_stem: &str,
    ) -> Result<UnitStats, AppError> {
        let mut stats = UnitStats::default();

        let cleaned = clean::clean(raw, fallback_ts, self.source_offset, self.mapping);
        stats.records = cleaned.records.len();
        stats.anomalies = cleaned.anomalies.len();

        let mut all_points: Vec<Point> = Vec::new();
        for (i, record) in cleaned.records.iter().enumerate() {
            let built = points::build(
                record,
                i,
                self.mapping,
                self.ctx.variables.as_ref(),
                &self.ctx.tags,
            );
            stats.anomalies += built.anomalies.len();
            all_points.extend(built.points);
        }
        stats.points = all_points.len();

        // Staging always happens, independent of the store-write outcome.
        let staging = self.stage_points(&all_points, retain_stem);
        match staging {
            Ok((staged, retained)) => {
                stats.staged = staged;
                stats.retained_file = retained;
            }
            Err(err) => {
                error!(error = %err, "staging failed; store write continues");
                stats.staging_error = Some(err.to_string());
            }
        }

        if self.ctx.write {
            if let Some(store) = self.store {
                let mut writable = Vec::with_capacity(all_points.len());
                for point in &all_points {
                    if should_write(point, self.ctx.override_existing, &self.checker)? {
                        writable.push(point.clone());
                    }
                }
                let write_stats = store.write_points(&writable)?;
                stats.written = write_stats.written;
                stats.rejected = write_stats.rejected;
            }
        }

        info!(
            records = stats.records,
            points = stats.points,
            staged = stats.staged,
            written = stats.written,
            anomalies = stats.anomalies,
            "processed payload"
        );
        Ok(stats)
    }

    fn stage_points(
        &self,
        all_points: &[Point],
        retain_stem: &str,
    ) -> Result<(usize, Option<std::path::PathBuf>), AppError> {
        let mut stager = Stager::create(&self.ctx.output_dir, self.run_id)?;
        let staged = stager.stage(all_points)?;
        let retained = if self.ctx.retain_file {
            stager.finalize(Some(retain_stem))?
        } else {
            stager.finalize(None)?
        };
        Ok((staged, retained))
    }

    fn track(&self, date: Option<NaiveDate>, result: &Result<UnitStats, String>) {
        let Some(runs_file) = &self.ctx.runs_file else {
            return;
        };
        let record = match result {
            Ok(stats) => RunRecord {
                run_time: Utc::now(),
                date,
                mode: self.ctx.mode,
                range: self.ctx.range,
                pid: self.run_id,
                success: stats.succeeded(),
                records: stats.records,
                points: stats.points,
                anomalies: stats.anomalies,
                staged_file: stats.retained_file.clone(),
            },
            Err(_) => RunRecord {
                run_time: Utc::now(),
                date,
                mode: self.ctx.mode,
                range: self.ctx.range,
                pid: self.run_id,
                success: false,
                records: 0,
                points: 0,
                anomalies: 0,
                staged_file: None,
            },
        };
        if let Err(err) = append_run(runs_file, &record) {
            // Metadata loss is not worth failing the pipeline over.
            warn!(error = %err, "failed to append run record");
        }
    }
}

/// Internal per-date error, split by whether it aborts the run.
enum DateError {
    Failed(String),
    Abort(AppError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FetchError;
    use crate::domain::{Mode, TagSet};
    use crate::mapping::FieldMapping;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    fn test_mapping() -> FieldMapping {
        FieldMapping::from_yaml_str(
            r#"
measurements:
  temperature_profile:
    "Temp Zone 1": temp_zone1
  process_params:
    "Pressure": pressure
"#,
        )
        .unwrap()
    }

    fn test_ctx(dates: Vec<NaiveDate>, out_dir: &std::path::Path) -> RunContext {
        RunContext {
            mode: Mode::Historic,
            dates,
            range: 2,
            write: false,
            override_existing: true,
            retain_file: false,
            delay_secs: 0,
            cadence_secs: 10,
            variables: None,
            source_utc_offset_minutes: 330,
            tags: TagSet::from([("source".to_string(), "bf2".to_string())]),
            output_dir: out_dir.to_path_buf(),
            runs_file: None,
        }
    }

    /// Canned source: payload per date, with configurable failures.
    struct StubSource {
        fail_on: Option<NaiveDate>,
        fatal_on: Option<NaiveDate>,
        live_payloads: AtomicUsize,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                fail_on: None,
                fatal_on: None,
                live_payloads: AtomicUsize::new(0),
            }
        }
    }

    impl DataSource for StubSource {
        fn fetch_date(&self, date: NaiveDate, _range: u8) -> Result<Value, FetchError> {
            if self.fatal_on == Some(date) {
                return Err(FetchError {
                    kind: crate::data::FetchErrorKind::Fatal,
                    message: "credentials rejected".to_string(),
                });
            }
            if self.fail_on == Some(date) {
                return Err(FetchError {
                    kind: crate::data::FetchErrorKind::Transient,
                    message: "connection reset".to_string(),
                });
            }
            Ok(json!([
                {"Timelogged": "05/24/2025 06:30:00 AM", "Temp Zone 1": "500.0", "Pressure": 2.1}
            ]))
        }

        fn fetch_live(&self) -> Result<Value, FetchError> {
            self.live_payloads.fetch_add(1, Ordering::Relaxed);
            Ok(json!({"Temp Zone 1": 501.0}))
        }
    }

    fn dates(from: (i32, u32, u32), n: i64) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(from.0, from.1, from.2).unwrap();
        (0..n).map(|i| start + chrono::Duration::days(i)).collect()
    }

    #[test]
    fn date_range_is_inclusive() {
        let d0 = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let d4 = NaiveDate::from_ymd_opt(2025, 5, 24).unwrap();
        let range = date_range(d0, d4);
        assert_eq!(range.len(), 5);
        assert_eq!(range[0], d0);
        assert_eq!(range[4], d4);
    }

    #[test]
    fn cadence_sleep_accounts_for_processing_time() {
        let cadence = Duration::from_secs(10);
        assert_eq!(
            cadence_sleep(cadence, Duration::from_secs(3)),
            Duration::from_secs(7)
        );
        assert_eq!(
            cadence_sleep(cadence, Duration::from_secs(12)),
            Duration::ZERO
        );
    }

    #[test]
    fn transient_failure_on_one_date_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = StubSource::new();
        source.fail_on = NaiveDate::from_ymd_opt(2025, 5, 21);

        let ctx = test_ctx(dates((2025, 5, 20), 5), dir.path());
        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        let summary = pipeline.run_dates().unwrap();

        assert_eq!(summary.outcomes.len(), 5);
        assert_eq!(
            summary.failed_dates(),
            vec![NaiveDate::from_ymd_opt(2025, 5, 21).unwrap()]
        );
        let totals = summary.totals();
        assert_eq!(totals.records, 4);
        assert_eq!(totals.points, 8);
    }

    #[test]
    fn fatal_failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = StubSource::new();
        source.fatal_on = NaiveDate::from_ymd_opt(2025, 5, 21);

        let ctx = test_ctx(dates((2025, 5, 20), 5), dir.path());
        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        let err = pipeline.run_dates().unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn variable_filter_restricts_emitted_points() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::new();
        let mut ctx = test_ctx(dates((2025, 5, 24), 1), dir.path());
        ctx.variables = Some(BTreeSet::from(["temp_zone1".to_string()]));

        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        let summary = pipeline.run_dates().unwrap();
        assert_eq!(summary.totals().points, 1);
    }

    #[test]
    fn retained_file_is_reported_in_stats() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::new();
        let mut ctx = test_ctx(dates((2025, 5, 24), 1), dir.path());
        ctx.retain_file = true;

        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        let summary = pipeline.run_dates().unwrap();
        let stats = summary.outcomes[0].result.as_ref().unwrap();
        let retained = stats.retained_file.as_ref().unwrap();
        assert!(retained.to_string_lossy().contains("date_2025-05-24_range2"));
        assert!(retained.exists());
    }

    #[test]
    fn run_records_are_appended_per_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = StubSource::new();
        source.fail_on = NaiveDate::from_ymd_opt(2025, 5, 21).unwrap().into();

        let mut ctx = test_ctx(dates((2025, 5, 20), 2), dir.path());
        ctx.runs_file = Some(dir.path().join("runs.jsonl"));

        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        pipeline.run_dates().unwrap();

        let runs = crate::track::load_runs(ctx.runs_file.as_ref().unwrap()).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].success);
        assert!(!runs[1].success);
    }

    #[test]
    fn live_loop_stops_at_cancellation_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::new();
        let mut ctx = test_ctx(Vec::new(), dir.path());
        ctx.mode = Mode::Live;
        ctx.cadence_secs = 0;

        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();

        // Pre-cancelled: the loop must exit without a tick.
        let cancel = AtomicBool::new(true);
        let summary = pipeline.run_live(&cancel).unwrap();
        assert_eq!(summary.ticks, 0);
    }

    #[test]
    fn in_flight_live_tick_finishes_after_cancellation() {
        struct CancellingSource<'a> {
            cancel: &'a AtomicBool,
        }

        impl DataSource for CancellingSource<'_> {
            fn fetch_date(&self, _date: NaiveDate, _range: u8) -> Result<Value, FetchError> {
                unreachable!("live-only source")
            }

            fn fetch_live(&self) -> Result<Value, FetchError> {
                // Simulates a signal arriving while the tick is in flight.
                self.cancel.store(true, Ordering::Relaxed);
                Ok(json!({"Pressure": 2.0}))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(false);
        let source = CancellingSource { cancel: &cancel };
        let mut ctx = test_ctx(Vec::new(), dir.path());
        ctx.mode = Mode::Live;

        let mapping = test_mapping();
        let pipeline = Pipeline::new(&source, None, &mapping, &ctx).unwrap();
        let summary = pipeline.run_live(&cancel).unwrap();
        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.failed_ticks, 0);
        assert_eq!(summary.points, 1);
    }
}
