//! Run metadata tracking.
//!
//! Appends one JSON record per processed date/tick to a JSONL file, so
//! operational tooling can answer "what ran, when, and how did it go"
//! without touching the store. Records are keyed by (date, mode); readers
//! take the last record per key, which gives re-runs upsert semantics.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Mode;
use crate::error::AppError;

/// Metadata for one processed unit of work (a date, or one live tick).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_time: DateTime<Utc>,
    /// Date processed; `None` for live ticks.
    pub date: Option<NaiveDate>,
    pub mode: Mode,
    pub range: u8,
    pub pid: u32,
    pub success: bool,
    pub records: usize,
    pub points: usize,
    pub anomalies: usize,
    pub staged_file: Option<PathBuf>,
}

/// Append one record to the runs file, creating parent directories as needed.
pub fn append_run(path: &Path, record: &RunRecord) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::usage(format!(
                    "Failed to create runs directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::usage(format!("Failed to open runs file '{}': {e}", path.display())))?;
    let line = serde_json::to_string(record)
        .map_err(|e| AppError::usage(format!("Failed to serialize run record: {e}")))?;
    writeln!(file, "{line}")
        .map_err(|e| AppError::usage(format!("Failed to write runs file '{}': {e}", path.display())))?;
    Ok(())
}

/// Load all records from a runs file. Malformed lines are skipped.
pub fn load_runs(path: &Path) -> Result<Vec<RunRecord>, AppError> {
    let file = fs::File::open(path)
        .map_err(|e| AppError::usage(format!("Failed to open runs file '{}': {e}", path.display())))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line
            .map_err(|e| AppError::usage(format!("Failed to read runs file '{}': {e}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<RunRecord>(&line) {
            out.push(record);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(date: NaiveDate, success: bool) -> RunRecord {
        RunRecord {
            run_time: Utc.with_ymd_and_hms(2025, 5, 25, 0, 5, 0).unwrap(),
            date: Some(date),
            mode: Mode::Daily,
            range: 2,
            pid: 1234,
            success,
            records: 288,
            points: 4032,
            anomalies: 3,
            staged_file: Some(PathBuf::from("output/date_2025-05-24_range2.txt.gz")),
        }
    }

    #[test]
    fn append_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("runs.jsonl");
        let d = NaiveDate::from_ymd_opt(2025, 5, 24).unwrap();

        append_run(&path, &record(d, false)).unwrap();
        append_run(&path, &record(d, true)).unwrap();

        let runs = load_runs(&path).unwrap();
        assert_eq!(runs.len(), 2);
        // Last record per key wins for readers.
        assert!(runs.last().unwrap().success);
        assert_eq!(runs[0].date, Some(d));
        assert_eq!(runs[0].points, 4032);
    }
}
