//! Time-series store writer.
//!
//! Writes serialized points to the store's line-protocol HTTP endpoint in
//! batches, with a short pause between batches. Store-unavailable failures
//! are surfaced to the orchestrator as per-date/per-tick errors; a batch the
//! store rejects as malformed is logged and skipped rather than failing the
//! whole write.

use std::thread::sleep;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{info, warn};

use crate::domain::Point;
use crate::error::AppError;
use crate::stage::serialize_points;

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_BATCH_DELAY_MILLIS: u64 = 500;

/// Connection parameters for the store, resolved from config + CLI + env.
#[derive(Debug, Clone)]
pub struct StoreParams {
    pub host: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// Blocking store client.
pub struct StoreClient {
    client: Client,
    params: StoreParams,
    batch_size: usize,
    batch_delay: Duration,
}

/// Result of one store write pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub written: usize,
    /// Lines the store rejected as malformed (skipped, not retried).
    pub rejected: usize,
}

impl StoreClient {
    pub fn new(params: StoreParams) -> Self {
        Self {
            client: Client::new(),
            params,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MILLIS),
        }
    }

    /// Write points to the store in line-protocol batches.
    pub fn write_points(&self, points: &[Point]) -> Result<WriteStats, AppError> {
        let lines = serialize_points(points)?;
        self.write_lines(&lines)
    }

    /// Write pre-serialized line-protocol lines (e.g., from a replayed
    /// staging file).
    pub fn write_lines(&self, lines: &[String]) -> Result<WriteStats, AppError> {
        let mut stats = WriteStats::default();
        let url = format!("{}/api/v2/write", self.params.host.trim_end_matches('/'));

        for (i, batch) in lines.chunks(self.batch_size).enumerate() {
            if i > 0 {
                sleep(self.batch_delay);
            }
            let body = batch.join("\n");
            let resp = self
                .client
                .post(&url)
                .query(&[
                    ("org", self.params.org.as_str()),
                    ("bucket", self.params.bucket.as_str()),
                    ("precision", "ns"),
                ])
                .header("Authorization", format!("Token {}", self.params.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(body)
                .send()
                .map_err(|e| AppError::data(format!("Store write request failed: {e}")))?;

            let status = resp.status();
            if status == reqwest::StatusCode::BAD_REQUEST {
                let detail = resp.text().unwrap_or_default();
                warn!(batch = i, lines = batch.len(), detail = %detail, "store rejected batch as malformed; skipping");
                stats.rejected += batch.len();
                continue;
            }
            if !status.is_success() {
                return Err(AppError::data(format!(
                    "Store write failed with status {status} on batch {i}."
                )));
            }
            stats.written += batch.len();
        }

        info!(written = stats.written, rejected = stats.rejected, "store write finished");
        Ok(stats)
    }
}
