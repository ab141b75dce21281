//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during a pipeline run
//! - staged to line-protocol text files
//! - reloaded later for replay or comparisons

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Ordered tag set applied to points. Ordering keeps serialized line
/// protocol stable.
pub type TagSet = BTreeMap<String, String>;

/// Declared type of a mapped field, from the field-mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Float,
    Int,
    String,
    Bool,
}

/// A typed scalar value for one field of one record.
///
/// `Missing` is the explicit "no value" marker: a raw null, empty string, or
/// unparseable value resolves to `Missing`, which downstream code treats as
/// "omit this field", never as zero or empty. `Float(0.0)` and `Text("")`
/// therefore always mean a value that was actually present at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Text(String),
    Bool(bool),
    Missing,
}

impl FieldValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, FieldValue::Missing)
    }
}

/// One normalized record: canonical field names -> typed values, plus the
/// resolved UTC timestamp.
///
/// `fields` holds only names known to the mapping table; raw names the table
/// does not know are carried in `unmapped` (typed as text) so the point
/// builder can skip and report them.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
    pub unmapped: BTreeMap<String, FieldValue>,
}

impl CleanedRecord {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
            unmapped: BTreeMap::new(),
        }
    }

    /// Number of fields carrying an actual value (not `Missing`).
    pub fn present_count(&self) -> usize {
        self.fields.values().filter(|v| !v.is_missing()).count()
    }
}

/// One time-series datum.
///
/// The natural key is `(measurement, tags, field, timestamp)`; the store's
/// at-most-one-value-per-key semantics for this tuple is what the override
/// policy relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: TagSet,
    pub field: String,
    pub value: FieldValue,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// The natural key identifying this point in the store.
    pub fn natural_key(&self) -> (String, Vec<(String, String)>, String, DateTime<Utc>) {
        (
            self.measurement.clone(),
            self.tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            self.field.clone(),
            self.timestamp,
        )
    }
}

/// A recoverable per-record/per-field anomaly encountered while cleaning or
/// building points. Anomalies are reported, never raised.
#[derive(Debug, Clone)]
pub struct Anomaly {
    /// Index of the record within the payload.
    pub record: usize,
    /// Field name involved, if the anomaly is field-level.
    pub field: Option<String>,
    pub message: String,
}

/// Operating mode for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Daily,
    Historic,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Daily => "daily",
            Mode::Historic => "historic",
            Mode::Live => "live",
        }
    }
}

/// Per-invocation configuration, assembled once at startup from
/// CLI + config file + environment, then immutable for the run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub mode: Mode,
    /// Pre-computed inclusive date list for daily/historic modes; empty for live.
    pub dates: Vec<NaiveDate>,
    /// Range parameter forwarded to the daily API.
    pub range: u8,
    /// Whether points are written to the store at all.
    pub write: bool,
    /// Unconditional-overwrite semantics when true.
    pub override_existing: bool,
    /// Keep (gzip) the staged file after the run instead of deleting it.
    pub retain_file: bool,
    /// Pause between dates in daily/historic mode, seconds.
    pub delay_secs: u64,
    /// Target interval between live ticks, seconds.
    pub cadence_secs: u64,
    /// Optional allow-list of canonical field names.
    pub variables: Option<BTreeSet<String>>,
    /// Fixed offset of naive source timestamps from UTC, minutes.
    pub source_utc_offset_minutes: i32,
    /// Tag set applied to every emitted point.
    pub tags: TagSet,
    pub output_dir: PathBuf,
    /// JSONL run-metadata file; `None` disables run tracking.
    pub runs_file: Option<PathBuf>,
}
