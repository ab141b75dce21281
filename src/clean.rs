//! Raw payload cleaning and normalization.
//!
//! This module turns an untrusted JSON payload (one date or one live tick)
//! into a sequence of `CleanedRecord`s that are safe to build points from.
//!
//! Design goals:
//! - **Total**: missing keys, nulls, string-encoded numbers, and duplicate
//!   timestamps all resolve to documented values; nothing here raises to the
//!   caller.
//! - **Record-level reporting**: every anomaly is collected and reported,
//!   never fatal (`Anomaly`, mirroring row-level ingest errors).
//! - **Deterministic**: output depends only on the payload, the supplied
//!   fallback timestamp, and the mapping table. Cleaning the same payload
//!   twice yields identical output.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Anomaly, CleanedRecord, FieldKind, FieldValue};
use crate::mapping::FieldMapping;

/// Payload key carrying the per-record source timestamp.
pub const TIMESTAMP_KEY: &str = "Timelogged";

/// Source timestamp format: naive local time, 12-hour clock.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Output of one cleaning pass.
#[derive(Debug, Clone)]
pub struct CleanOutput {
    pub records: Vec<CleanedRecord>,
    pub anomalies: Vec<Anomaly>,
    /// Number of raw records seen in the payload (before any filtering).
    pub raw_count: usize,
}

/// Clean one raw payload into normalized records.
///
/// The payload may be a JSON array of per-timestamp objects (daily/historic)
/// or a single object (live tick). Records that carry a parseable
/// `Timelogged` value get their own timestamp, interpreted at
/// `source_offset` and normalized to UTC; all others use `fallback_ts`.
pub fn clean(
    raw: &Value,
    fallback_ts: DateTime<Utc>,
    source_offset: FixedOffset,
    mapping: &FieldMapping,
) -> CleanOutput {
    // Rows keep their original payload index so anomaly positions stay
    // meaningful when non-object entries are skipped.
    let rows: Vec<(usize, &serde_json::Map<String, Value>)> = match raw {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_object().map(|obj| (i, obj)))
            .collect(),
        Value::Object(obj) => vec![(0, obj)],
        _ => Vec::new(),
    };

    let mut out = CleanOutput {
        records: Vec::with_capacity(rows.len()),
        anomalies: Vec::new(),
        raw_count: rows.len(),
    };

    // Non-object array entries and non-object/array payloads are payload-level
    // anomalies, resolved by skipping.
    match raw {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_object() {
                    out.anomalies.push(Anomaly {
                        record: i,
                        field: None,
                        message: format!("Payload entry {i} is not an object; skipped."),
                    });
                }
            }
            out.raw_count = items.len();
        }
        Value::Object(_) => {}
        other => {
            out.anomalies.push(Anomaly {
                record: 0,
                field: None,
                message: format!(
                    "Payload is not an object or array (got {}); nothing to clean.",
                    json_type_name(other)
                ),
            });
        }
    }

    for (index, row) in rows {
        let timestamp = resolve_timestamp(row, index, fallback_ts, source_offset, &mut out.anomalies);
        let mut record = CleanedRecord::new(timestamp);

        for (raw_name, value) in row.iter() {
            if raw_name == TIMESTAMP_KEY {
                continue;
            }
            match mapping.by_raw(raw_name) {
                Some(spec) => {
                    let coerced = coerce(value, spec.kind).unwrap_or_else(|msg| {
                        out.anomalies.push(Anomaly {
                            record: index,
                            field: Some(spec.canonical.clone()),
                            message: msg,
                        });
                        FieldValue::Missing
                    });
                    record.fields.insert(spec.canonical.clone(), coerced);
                }
                None => {
                    // Unknown raw names are carried through (typed as text) so
                    // the point builder can skip and report them.
                    record
                        .unmapped
                        .insert(raw_name.clone(), passthrough_text(value));
                }
            }
        }

        out.records.push(record);
    }

    debug!(
        raw = out.raw_count,
        cleaned = out.records.len(),
        anomalies = out.anomalies.len(),
        "cleaned payload"
    );
    out
}

/// Resolve the record timestamp: payload-supplied when parseable, otherwise
/// the fallback. A present-but-unparseable timestamp is an anomaly.
fn resolve_timestamp(
    row: &serde_json::Map<String, Value>,
    index: usize,
    fallback_ts: DateTime<Utc>,
    source_offset: FixedOffset,
    anomalies: &mut Vec<Anomaly>,
) -> DateTime<Utc> {
    let Some(raw_ts) = row.get(TIMESTAMP_KEY) else {
        return fallback_ts;
    };

    let text = match raw_ts {
        Value::String(s) if !s.trim().is_empty() => s.trim(),
        Value::Null => return fallback_ts,
        Value::String(_) => return fallback_ts,
        other => {
            anomalies.push(Anomaly {
                record: index,
                field: Some(TIMESTAMP_KEY.to_string()),
                message: format!(
                    "Timestamp is not a string (got {}); using fallback.",
                    json_type_name(other)
                ),
            });
            return fallback_ts;
        }
    };

    match NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        Ok(naive) => match naive.and_local_timezone(source_offset).single() {
            Some(local) => local.with_timezone(&Utc),
            None => {
                anomalies.push(Anomaly {
                    record: index,
                    field: Some(TIMESTAMP_KEY.to_string()),
                    message: format!("Ambiguous local timestamp '{text}'; using fallback."),
                });
                fallback_ts
            }
        },
        Err(e) => {
            anomalies.push(Anomaly {
                record: index,
                field: Some(TIMESTAMP_KEY.to_string()),
                message: format!("Failed to parse timestamp '{text}': {e}; using fallback."),
            });
            fallback_ts
        }
    }
}

/// Coerce one raw JSON value to its declared kind.
///
/// Null and empty strings are the explicit "no value" marker. A value that
/// fails to parse as its declared type is an error (the caller records the
/// anomaly and substitutes `Missing`).
fn coerce(value: &Value, kind: FieldKind) -> Result<FieldValue, String> {
    match value {
        Value::Null => return Ok(FieldValue::Missing),
        Value::String(s) if s.trim().is_empty() => return Ok(FieldValue::Missing),
        _ => {}
    }

    match kind {
        FieldKind::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float)
                .ok_or_else(|| format!("Non-finite numeric value {n}.")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float)
                .ok_or_else(|| format!("Failed to parse '{}' as float.", s.trim())),
            other => Err(format!(
                "Expected float, got {}.",
                json_type_name(other)
            )),
        },
        FieldKind::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Int)
                .ok_or_else(|| format!("Value {n} is not an integer.")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Int)
                .map_err(|_| format!("Failed to parse '{}' as int.", s.trim())),
            other => Err(format!("Expected int, got {}.", json_type_name(other))),
        },
        FieldKind::String => match value {
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
            Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            other => Err(format!("Expected string, got {}.", json_type_name(other))),
        },
        FieldKind::Bool => match value {
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(format!("Failed to parse '{}' as bool.", s.trim())),
            },
            other => Err(format!("Expected bool, got {}.", json_type_name(other))),
        },
    }
}

/// Render an unmapped raw value as text so it survives to the point builder's
/// unknown-field report without losing information.
fn passthrough_text(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Missing,
        Value::String(s) if s.trim().is_empty() => FieldValue::Missing,
        Value::String(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Text(other.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldMapping;
    use chrono::TimeZone;
    use serde_json::json;

    fn test_mapping() -> FieldMapping {
        FieldMapping::from_yaml_str(
            r#"
measurements:
  temperature_profile:
    "Temp Zone 1": temp_zone1
    "Temp Note": temp_note
  process_params:
    "Pressure": pressure
    "Tap Count": tap_count
string_fields: [temp_note]
int_fields: [tap_count]
"#,
        )
        .unwrap()
    }

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 24, 0, 0, 0).unwrap()
    }

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    #[test]
    fn string_encoded_numbers_are_coerced() {
        let raw = json!([{"Temp Zone 1": "12.5", "Tap Count": "7"}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(out.records.len(), 1);
        assert!(out.anomalies.is_empty());
        assert_eq!(
            out.records[0].fields.get("temp_zone1"),
            Some(&FieldValue::Float(12.5))
        );
        assert_eq!(
            out.records[0].fields.get("tap_count"),
            Some(&FieldValue::Int(7))
        );
    }

    #[test]
    fn null_and_empty_become_missing_not_zero() {
        let raw = json!([{"Temp Zone 1": null, "Pressure": ""}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        let rec = &out.records[0];
        assert_eq!(rec.fields.get("temp_zone1"), Some(&FieldValue::Missing));
        assert_eq!(rec.fields.get("pressure"), Some(&FieldValue::Missing));
        assert_eq!(rec.present_count(), 0);
        // Null/empty is policy, not an anomaly.
        assert!(out.anomalies.is_empty());
    }

    #[test]
    fn unparseable_numeric_is_missing_plus_anomaly() {
        let raw = json!([{"Pressure": "n/a"}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(
            out.records[0].fields.get("pressure"),
            Some(&FieldValue::Missing)
        );
        assert_eq!(out.anomalies.len(), 1);
        assert_eq!(out.anomalies[0].field.as_deref(), Some("pressure"));
    }

    #[test]
    fn record_timestamp_is_localized_to_utc() {
        let raw = json!([{
            "Timelogged": "05/24/2025 06:30:00 AM",
            "Pressure": 2.1
        }]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        // 06:30 at +05:30 is 01:00 UTC.
        assert_eq!(
            out.records[0].timestamp,
            Utc.with_ymd_and_hms(2025, 5, 24, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn missing_timestamp_uses_fallback_without_anomaly() {
        let raw = json!([{"Pressure": 2.1}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(out.records[0].timestamp, fallback());
        assert!(out.anomalies.is_empty());
    }

    #[test]
    fn bad_timestamp_falls_back_with_anomaly() {
        let raw = json!([{"Timelogged": "yesterday-ish", "Pressure": 2.1}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(out.records[0].timestamp, fallback());
        assert_eq!(out.anomalies.len(), 1);
        assert_eq!(out.anomalies[0].field.as_deref(), Some(TIMESTAMP_KEY));
    }

    #[test]
    fn unknown_raw_fields_are_carried_as_unmapped() {
        let raw = json!([{"Mystery Sensor": 4.2, "Pressure": 2.1}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        let rec = &out.records[0];
        assert_eq!(rec.fields.len(), 1);
        assert!(rec.unmapped.contains_key("Mystery Sensor"));
    }

    #[test]
    fn string_typed_field_keeps_text() {
        let raw = json!([{"Temp Note": "sensor swapped"}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(
            out.records[0].fields.get("temp_note"),
            Some(&FieldValue::Text("sensor swapped".to_string()))
        );
    }

    #[test]
    fn payload_order_is_preserved() {
        let raw = json!([
            {"Timelogged": "05/24/2025 01:00:00 AM", "Pressure": 1.0},
            {"Timelogged": "05/24/2025 02:00:00 AM", "Pressure": 2.0},
            {"Timelogged": "05/24/2025 01:30:00 AM", "Pressure": 1.5}
        ]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        let values: Vec<_> = out
            .records
            .iter()
            .map(|r| r.fields.get("pressure").cloned().unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                FieldValue::Float(1.0),
                FieldValue::Float(2.0),
                FieldValue::Float(1.5)
            ]
        );
    }

    #[test]
    fn anomaly_indices_track_payload_positions() {
        // A skipped non-object entry must not shift the indices reported for
        // later rows.
        let raw = json!([42, {"Pressure": "n/a"}]);
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.raw_count, 2);
        assert_eq!(out.anomalies.len(), 2);
        assert_eq!(out.anomalies[0].record, 0);
        assert_eq!(out.anomalies[0].field, None);
        assert_eq!(out.anomalies[1].record, 1);
        assert_eq!(out.anomalies[1].field.as_deref(), Some("pressure"));
    }

    #[test]
    fn cleaning_is_idempotent() {
        let raw = json!([
            {"Timelogged": "05/24/2025 06:30:00 AM", "Temp Zone 1": "500", "Pressure": null},
            {"Mystery": "x", "Tap Count": 3}
        ]);
        let a = clean(&raw, fallback(), offset(), &test_mapping());
        let b = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(a.records, b.records);
        assert_eq!(a.anomalies.len(), b.anomalies.len());
    }

    #[test]
    fn scalar_payload_yields_no_records_and_one_anomaly() {
        let raw = json!("not a payload");
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert!(out.records.is_empty());
        assert_eq!(out.anomalies.len(), 1);
    }

    #[test]
    fn single_object_payload_is_one_record() {
        let raw = json!({"Pressure": "2.5"});
        let out = clean(&raw, fallback(), offset(), &test_mapping());
        assert_eq!(out.records.len(), 1);
        assert_eq!(
            out.records[0].fields.get("pressure"),
            Some(&FieldValue::Float(2.5))
        );
    }
}
