//! Upstream sensor API integration.
//!
//! Fetches raw JSON payloads from the daily (historic) and live endpoints.
//! Transient failures (network errors, 5xx, bad payloads) are retried a
//! bounded number of times and then surfaced as per-date/per-tick failures;
//! authentication-class failures (401/403) are fatal and abort the run.

use std::thread::sleep;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::AppError;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 10;

/// Failure class the orchestrator uses for its retry/abort decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Retried here; if exhausted, recorded as a per-date/per-tick failure.
    Transient,
    /// Authentication-class; aborts the whole run.
    Fatal,
}

/// A failed fetch, classified.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FetchErrorKind::Fatal
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err.kind {
            FetchErrorKind::Transient => AppError::data(err.message),
            FetchErrorKind::Fatal => AppError::fatal(err.message),
        }
    }
}

/// Abstract source of raw payloads. The orchestrator is generic over this so
/// tests can inject canned payloads and failure sequences.
pub trait DataSource {
    /// Fetch the payload for one historic date.
    fn fetch_date(&self, date: NaiveDate, range: u8) -> Result<Value, FetchError>;

    /// Fetch the current live tick.
    fn fetch_live(&self) -> Result<Value, FetchError>;
}

/// Blocking HTTP client for the upstream API.
pub struct ApiClient {
    client: Client,
    daily_url: String,
    daily_user: String,
    daily_password: String,
    live_url: String,
    live_user: String,
    live_password: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl ApiClient {
    /// Build the client from environment variables (`.env` supported):
    /// `API_URL_DAILY`, `API_USER_DAILY`, `API_PASSWORD_DAILY`,
    /// `API_URL_LIVE`, `API_USER_LIVE`, `API_PASSWORD_LIVE`.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| AppError::usage(format!("Missing {name} in environment (.env).")))
        };
        Ok(Self {
            client: Client::new(),
            daily_url: var("API_URL_DAILY")?,
            daily_user: var("API_USER_DAILY")?,
            daily_password: var("API_PASSWORD_DAILY")?,
            live_url: var("API_URL_LIVE")?,
            live_user: var("API_USER_LIVE")?,
            live_password: var("API_PASSWORD_LIVE")?,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        })
    }

    fn fetch_with_retry(
        &self,
        url: &str,
        params: &[(&str, String)],
        what: &str,
    ) -> Result<Value, FetchError> {
        let mut last_err = FetchError::transient(format!("{what}: no attempts made."));
        for attempt in 1..=self.max_retries {
            match self.fetch_once(url, params, what) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "{what} fetch failed");
                    last_err = err;
                    if attempt < self.max_retries {
                        sleep(self.retry_delay);
                    }
                }
            }
        }
        Err(last_err)
    }

    fn fetch_once(
        &self,
        url: &str,
        params: &[(&str, String)],
        what: &str,
    ) -> Result<Value, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(|e| FetchError::transient(format!("{what} request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::fatal(format!(
                "{what} request rejected with status {status}; check API credentials."
            )));
        }
        if !status.is_success() {
            return Err(FetchError::transient(format!(
                "{what} request failed with status {status}."
            )));
        }

        let body: Value = resp
            .json()
            .map_err(|e| FetchError::transient(format!("Failed to parse {what} response: {e}")))?;

        if body.is_null() {
            return Err(FetchError::transient(format!("{what} response is empty.")));
        }

        Ok(body)
    }
}

impl DataSource for ApiClient {
    fn fetch_date(&self, date: NaiveDate, range: u8) -> Result<Value, FetchError> {
        info!(%date, range, "fetching daily payload");
        let params = [
            ("user", self.daily_user.clone()),
            ("password", self.daily_password.clone()),
            ("month", date.month().to_string()),
            ("day", date.day().to_string()),
            ("year", date.year().to_string()),
            ("range", range.to_string()),
        ];
        self.fetch_with_retry(&self.daily_url, &params, "daily API")
    }

    fn fetch_live(&self) -> Result<Value, FetchError> {
        let params = [
            ("user", self.live_user.clone()),
            ("password", self.live_password.clone()),
        ];
        self.fetch_with_retry(&self.live_url, &params, "live API")
    }
}
