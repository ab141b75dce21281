//! Formatted terminal output for run summaries.
//!
//! We keep formatting code in one place so:
//! - the pipeline code stays clean and testable
//! - output changes are localized

use crate::app::pipeline::{LiveSummary, RunSummary};
use crate::domain::RunContext;

/// Format the end-of-run summary for daily/historic modes.
///
/// A run that completed with anomalies is still a success; failed dates are
/// listed with their reasons.
pub fn format_run_summary(summary: &RunSummary, ctx: &RunContext) -> String {
    let totals = summary.totals();
    let failed = summary.failed_dates();
    let mut out = String::new();

    out.push_str("=== bfi - sensor ingestion run ===\n");
    out.push_str(&format!("Mode: {}\n", ctx.mode.as_str()));
    out.push_str(&format!(
        "Dates: {} processed, {} failed\n",
        summary.outcomes.len() - failed.len(),
        failed.len(),
    ));
    out.push_str(&format!(
        "Records: {} | Points: {} | Staged: {} | Written: {} | Rejected: {}\n",
        totals.records, totals.points, totals.staged, totals.written, totals.rejected,
    ));
    out.push_str(&format!("Anomalies: {}\n", totals.anomalies));

    for outcome in &summary.outcomes {
        match &outcome.result {
            Ok(stats) => {
                if let Some(err) = &stats.staging_error {
                    out.push_str(&format!("  {}: staging failed: {err}\n", outcome.date));
                }
                if let Some(path) = &stats.retained_file {
                    out.push_str(&format!("  {}: retained {}\n", outcome.date, path.display()));
                }
            }
            Err(message) => {
                out.push_str(&format!("  {}: FAILED: {message}\n", outcome.date));
            }
        }
    }

    out
}

/// Format the summary printed after the live loop is cancelled.
pub fn format_live_summary(summary: &LiveSummary) -> String {
    format!(
        "=== bfi - live loop stopped ===\nTicks: {} ({} failed) | Points: {} | Anomalies: {}\n",
        summary.ticks, summary.failed_ticks, summary.points, summary.anomalies,
    )
}
