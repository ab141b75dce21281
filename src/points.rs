//! Point construction from cleaned records.
//!
//! Converts one `CleanedRecord` into a set of uniquely-keyed time-series
//! points using the field-mapping table. The record->point mapping is a
//! function: within one invocation no two output points share a natural key.

use std::collections::BTreeSet;

use tracing::debug;

use crate::domain::{Anomaly, CleanedRecord, Point, TagSet};
use crate::mapping::FieldMapping;

/// Output of one build pass over a record.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub points: Vec<Point>,
    pub anomalies: Vec<Anomaly>,
}

/// Build points for every present (non-missing) canonical field of `record`.
///
/// - Fields whose value is `Missing` are omitted entirely, never written as
///   zero/empty.
/// - Raw names the mapping does not know (carried in `record.unmapped`) are
///   skipped and reported.
/// - When `variable_filter` is supplied, only canonical names in the filter
///   are emitted; an empty match is zero points, not an error.
pub fn build(
    record: &CleanedRecord,
    record_index: usize,
    mapping: &FieldMapping,
    variable_filter: Option<&BTreeSet<String>>,
    tags: &TagSet,
) -> BuildOutput {
    let mut out = BuildOutput::default();

    for (canonical, value) in &record.fields {
        if value.is_missing() {
            continue;
        }
        if let Some(filter) = variable_filter {
            if !filter.contains(canonical) {
                continue;
            }
        }
        let Some(spec) = mapping.by_canonical(canonical) else {
            // Cleaner only emits mapped names; reaching this means the record
            // was built against a different table than the one supplied here.
            out.anomalies.push(Anomaly {
                record: record_index,
                field: Some(canonical.clone()),
                message: format!("Canonical field '{canonical}' missing from mapping table; skipped."),
            });
            continue;
        };

        out.points.push(Point {
            measurement: spec.measurement.clone(),
            tags: tags.clone(),
            field: canonical.clone(),
            value: value.clone(),
            timestamp: record.timestamp,
        });
    }

    for raw_name in record.unmapped.keys() {
        out.anomalies.push(Anomaly {
            record: record_index,
            field: Some(raw_name.clone()),
            message: format!("Unknown raw field '{raw_name}'; skipped."),
        });
    }

    debug!(
        record = record_index,
        points = out.points.len(),
        skipped = out.anomalies.len(),
        "built points"
    );
    out
}
