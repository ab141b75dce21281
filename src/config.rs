//! Application configuration.
//!
//! Three layers, resolved once at startup:
//!
//! - a YAML config file for store coordinates, timezone offset, output paths,
//!   and the tag set applied to every point
//! - environment (`.env` supported) for secrets: API credentials and the
//!   store token
//! - CLI flags for per-run overrides (host/org/bucket, output dir)
//!
//! The resolved values are folded into an immutable `RunContext` owned by
//! the orchestrator.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::TagSet;
use crate::error::AppError;

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_runs_file() -> Option<PathBuf> {
    Some(PathBuf::from("db/runs.jsonl"))
}

/// Store coordinates from the config file (token comes from the environment).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub host: String,
    pub org: String,
    pub bucket: String,
}

/// The app config YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreSection,
    /// Fixed offset of naive source timestamps from UTC, in minutes.
    #[serde(default)]
    pub source_utc_offset_minutes: i32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// JSONL run-metadata file; set to null to disable tracking.
    #[serde(default = "default_runs_file")]
    pub runs_file: Option<PathBuf>,
    /// Tags applied to every emitted point.
    #[serde(default)]
    pub tags: TagSet,
}

impl AppConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|e| {
            AppError::usage(format!("Failed to open config '{}': {e}", path.display()))
        })?;
        serde_yaml::from_reader(file)
            .map_err(|e| AppError::usage(format!("Invalid config YAML: {e}")))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(text)
            .map_err(|e| AppError::usage(format!("Invalid config YAML: {e}")))
    }
}

/// Read the store token from the environment (`.env` supported).
pub fn store_token_from_env() -> Result<String, AppError> {
    dotenvy::dotenv().ok();
    std::env::var("INFLUXDB_TOKEN")
        .map_err(|_| AppError::usage("Missing INFLUXDB_TOKEN in environment (.env)."))
}

/// Load the variable allow-list: one canonical field name per line, blank
/// lines and `#` comments ignored.
pub fn load_variables(path: &Path) -> Result<BTreeSet<String>, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::usage(format!(
            "Failed to open variables file '{}': {e}",
            path.display()
        ))
    })?;
    let mut out = BTreeSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| {
            AppError::usage(format!(
                "Failed to read variables file '{}': {e}",
                path.display()
            ))
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.insert(trimmed.to_string());
    }
    if out.is_empty() {
        return Err(AppError::usage(format!(
            "Variables file '{}' contains no field names.",
            path.display()
        )));
    }
    Ok(out)
}
