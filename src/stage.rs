//! Point staging: line-protocol serialization and the per-run staging file.
//!
//! Every run stages all points to a deterministic temporary file (keyed by
//! run id) regardless of whether store writes are enabled, so there is
//! always an audit trail independent of store availability. On finalize the
//! file is either gzip-compressed into a persistent output name or deleted;
//! the `Drop` impl guarantees the temporary file goes away on every exit
//! path, including errors raised deeper in the pipeline.
//!
//! Serialization is one line per grouped point set:
//!
//! ```text
//! measurement,tag1=v1,tag2=v2 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! The format is re-parseable: `parse_line_protocol(serialize_points(p))`
//! reproduces the same natural-key set and values.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::domain::{FieldValue, Point, TagSet};
use crate::error::AppError;

/// Serialize points to line-protocol lines.
///
/// Points sharing (measurement, tags, timestamp) are folded into one line
/// with multiple `field=value` pairs. Points whose value is `Missing` are
/// never serialized.
pub fn serialize_points(points: &[Point]) -> Result<Vec<String>, AppError> {
    // Group key ordering keeps output deterministic across runs.
    let mut groups: BTreeMap<(String, i64), Vec<(String, String)>> = BTreeMap::new();

    for point in points {
        if point.value.is_missing() {
            continue;
        }
        let ts_ns = point.timestamp.timestamp_nanos_opt().ok_or_else(|| {
            AppError::usage(format!(
                "Timestamp {} is outside the nanosecond-representable range.",
                point.timestamp
            ))
        })?;
        let prefix = line_prefix(&point.measurement, &point.tags);
        groups
            .entry((prefix, ts_ns))
            .or_default()
            .push((escape_key(&point.field), render_value(&point.value)));
    }

    let mut lines = Vec::with_capacity(groups.len());
    for ((prefix, ts_ns), mut fields) in groups {
        fields.sort();
        let field_part = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("{prefix} {field_part} {ts_ns}"));
    }
    Ok(lines)
}

/// Parse line-protocol text back into points.
///
/// String field values come back as `Text`, integers (`i` suffix) as `Int`,
/// `true`/`false` as `Bool`, everything else as `Float`.
pub fn parse_line_protocol(text: &str) -> Result<Vec<Point>, AppError> {
    let mut points = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (head, fields_part, ts_part) = split_sections(line).ok_or_else(|| {
            AppError::data(format!("Malformed line-protocol line {}.", line_no + 1))
        })?;

        let (measurement, tags) = parse_head(&head, line_no)?;
        let ts_ns: i64 = ts_part.trim().parse().map_err(|_| {
            AppError::data(format!(
                "Invalid timestamp '{}' on line {}.",
                ts_part.trim(),
                line_no + 1
            ))
        })?;
        let timestamp: DateTime<Utc> = Utc.timestamp_nanos(ts_ns);

        for (field, value) in parse_fields(&fields_part, line_no)? {
            points.push(Point {
                measurement: measurement.clone(),
                tags: tags.clone(),
                field,
                value,
                timestamp,
            });
        }
    }
    Ok(points)
}

/// Per-run staging file with guaranteed cleanup.
pub struct Stager {
    tmp_path: PathBuf,
    out_dir: PathBuf,
    writer: Option<BufWriter<File>>,
    staged: usize,
    finalized: bool,
}

impl Stager {
    /// Create the staging file `tmp_<run_id>.txt` under `out_dir`.
    pub fn create(out_dir: &Path, run_id: u32) -> Result<Self, AppError> {
        fs::create_dir_all(out_dir).map_err(|e| {
            AppError::usage(format!(
                "Failed to create output directory '{}': {e}",
                out_dir.display()
            ))
        })?;
        let tmp_path = out_dir.join(format!("tmp_{run_id}.txt"));
        let file = File::create(&tmp_path).map_err(|e| {
            AppError::usage(format!(
                "Failed to create staging file '{}': {e}",
                tmp_path.display()
            ))
        })?;
        debug!(path = %tmp_path.display(), "created staging file");
        Ok(Self {
            tmp_path,
            out_dir: out_dir.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            staged: 0,
            finalized: false,
        })
    }

    /// Append points to the staging file. Returns the number of points staged
    /// by this call.
    pub fn stage(&mut self, points: &[Point]) -> Result<usize, AppError> {
        let lines = serialize_points(points)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AppError::usage("Staging file already finalized."))?;
        for line in &lines {
            writeln!(writer, "{line}").map_err(|e| {
                AppError::usage(format!(
                    "Failed to write staging file '{}': {e}",
                    self.tmp_path.display()
                ))
            })?;
        }
        writer.flush().map_err(|e| {
            AppError::usage(format!(
                "Failed to flush staging file '{}': {e}",
                self.tmp_path.display()
            ))
        })?;
        let count = points.iter().filter(|p| !p.value.is_missing()).count();
        self.staged += count;
        Ok(count)
    }

    pub fn staged(&self) -> usize {
        self.staged
    }

    pub fn path(&self) -> &Path {
        &self.tmp_path
    }

    /// Finish the staging file.
    ///
    /// With `retain_as = Some(stem)` the file is gzip-compressed to
    /// `<out_dir>/<stem>.txt.gz` and the temporary file removed; the final
    /// path is returned. With `None` the temporary file is deleted.
    pub fn finalize(mut self, retain_as: Option<&str>) -> Result<Option<PathBuf>, AppError> {
        // Close the writer before touching the file on disk.
        if let Some(writer) = self.writer.take() {
            writer
                .into_inner()
                .map_err(|e| AppError::usage(format!("Failed to flush staging file: {e}")))?
                .sync_all()
                .map_err(|e| AppError::usage(format!("Failed to sync staging file: {e}")))?;
        }

        let Some(stem) = retain_as else {
            fs::remove_file(&self.tmp_path).map_err(|e| {
                AppError::usage(format!(
                    "Failed to remove staging file '{}': {e}",
                    self.tmp_path.display()
                ))
            })?;
            self.finalized = true;
            return Ok(None);
        };

        let final_path = self.out_dir.join(format!("{stem}.txt.gz"));
        let mut input = File::open(&self.tmp_path).map_err(|e| {
            AppError::usage(format!(
                "Failed to reopen staging file '{}': {e}",
                self.tmp_path.display()
            ))
        })?;
        let output = File::create(&final_path).map_err(|e| {
            AppError::usage(format!(
                "Failed to create retained file '{}': {e}",
                final_path.display()
            ))
        })?;
        let mut encoder = GzEncoder::new(output, Compression::default());
        let mut buf = Vec::new();
        input
            .read_to_end(&mut buf)
            .and_then(|_| encoder.write_all(&buf))
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| {
                AppError::usage(format!(
                    "Failed to gzip staged points to '{}': {e}",
                    final_path.display()
                ))
            })?;
        fs::remove_file(&self.tmp_path).map_err(|e| {
            AppError::usage(format!(
                "Failed to remove staging file '{}': {e}",
                self.tmp_path.display()
            ))
        })?;
        self.finalized = true;
        info!(path = %final_path.display(), points = self.staged, "retained staged points");
        Ok(Some(final_path))
    }
}

impl Drop for Stager {
    fn drop(&mut self) {
        if !self.finalized {
            self.writer.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn line_prefix(measurement: &str, tags: &TagSet) -> String {
    let mut prefix = escape_key(measurement);
    for (k, v) in tags {
        prefix.push(',');
        prefix.push_str(&escape_key(k));
        prefix.push('=');
        prefix.push_str(&escape_key(v));
    }
    prefix
}

fn render_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{v}"),
        FieldValue::Int(v) => format!("{v}i"),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Text(s) => {
            // Text comes from arbitrary JSON strings; newlines must not split
            // the physical line.
            let escaped = s
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\r', "\\r");
            format!("\"{escaped}\"")
        }
        FieldValue::Missing => String::new(),
    }
}

fn escape_key(key: &str) -> String {
    key.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

fn unescape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split one line into (measurement+tags, fields, timestamp), honoring
/// backslash escapes and quoted string values.
fn split_sections(line: &str) -> Option<(String, String, String)> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut in_quotes = false;

    for c in line.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if sections.len() == 1 => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ' ' if !in_quotes && sections.len() < 2 => {
                sections.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    sections.push(current);

    if sections.len() != 3 || in_quotes {
        return None;
    }
    let mut it = sections.into_iter();
    Some((it.next()?, it.next()?, it.next()?))
}

fn parse_head(head: &str, line_no: usize) -> Result<(String, TagSet), AppError> {
    let parts = split_unescaped(head, ',');
    let mut it = parts.into_iter();
    let measurement = unescape_key(&it.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err(AppError::data(format!(
            "Empty measurement on line {}.",
            line_no + 1
        )));
    }
    let mut tags = TagSet::new();
    for part in it {
        let kv = split_unescaped(&part, '=');
        if kv.len() != 2 {
            return Err(AppError::data(format!(
                "Malformed tag '{part}' on line {}.",
                line_no + 1
            )));
        }
        tags.insert(unescape_key(&kv[0]), unescape_key(&kv[1]));
    }
    Ok((measurement, tags))
}

fn parse_fields(fields_part: &str, line_no: usize) -> Result<Vec<(String, FieldValue)>, AppError> {
    let mut out = Vec::new();
    for pair in split_field_pairs(fields_part) {
        // Split at the first unescaped '='; quoted string values may contain
        // '=' themselves.
        let Some((name, value)) = split_once_unescaped(&pair, '=') else {
            return Err(AppError::data(format!(
                "Malformed field '{pair}' on line {}.",
                line_no + 1
            )));
        };
        out.push((unescape_key(&name), parse_field_value(&value)));
    }
    Ok(out)
}

/// Split at the first unescaped occurrence of `sep`.
fn split_once_unescaped(text: &str, sep: char) -> Option<(String, String)> {
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((text[..i].to_string(), text[i + c.len_utf8()..].to_string()));
        }
    }
    None
}

fn parse_field_value(raw: &str) -> FieldValue {
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some(next) => out.push(next),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        return FieldValue::Text(out);
    }
    if raw == "true" {
        return FieldValue::Bool(true);
    }
    if raw == "false" {
        return FieldValue::Bool(false);
    }
    if let Some(int_part) = raw.strip_suffix('i') {
        if let Ok(v) = int_part.parse::<i64>() {
            return FieldValue::Int(v);
        }
    }
    match raw.parse::<f64>() {
        Ok(v) => FieldValue::Float(v),
        Err(_) => FieldValue::Text(raw.to_string()),
    }
}

/// Split on `sep` outside of backslash escapes.
fn split_unescaped(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts
}

/// Split `field=value` pairs on commas outside quoted strings and escapes.
fn split_field_pairs(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut in_quotes = false;
    for c in text.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 24, 1, 0, 0).unwrap()
    }

    fn point(measurement: &str, field: &str, value: FieldValue) -> Point {
        Point {
            measurement: measurement.to_string(),
            tags: TagSet::from([("source".to_string(), "bf2".to_string())]),
            field: field.to_string(),
            value,
            timestamp: ts(),
        }
    }

    #[test]
    fn serialize_groups_by_measurement_and_timestamp() {
        let points = vec![
            point("process_params", "pressure", FieldValue::Float(2.1)),
            point("process_params", "o2_enrichment", FieldValue::Float(4.0)),
            point("temperature_profile", "temp_zone1", FieldValue::Float(500.0)),
        ];
        let lines = serialize_points(&points).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("process_params,source=bf2 "));
        assert!(lines[0].contains("o2_enrichment=4,pressure=2.1"));
        assert!(lines[1].starts_with("temperature_profile,source=bf2 "));
    }

    #[test]
    fn round_trip_preserves_natural_keys_and_values() {
        let points = vec![
            point("process_params", "pressure", FieldValue::Float(2.1)),
            point("process_params", "tap_count", FieldValue::Int(7)),
            point("temperature_profile", "note", FieldValue::Text("a, b \"q\"".into())),
            point("miscellaneous", "stable", FieldValue::Bool(true)),
        ];
        let text = serialize_points(&points).unwrap().join("\n");
        let parsed = parse_line_protocol(&text).unwrap();

        let keys = |ps: &[Point]| -> BTreeSet<_> { ps.iter().map(Point::natural_key).collect() };
        assert_eq!(keys(&points), keys(&parsed));

        let find = |field: &str| {
            parsed
                .iter()
                .find(|p| p.field == field)
                .map(|p| p.value.clone())
                .unwrap()
        };
        assert_eq!(find("pressure"), FieldValue::Float(2.1));
        assert_eq!(find("tap_count"), FieldValue::Int(7));
        assert_eq!(find("note"), FieldValue::Text("a, b \"q\"".into()));
        assert_eq!(find("stable"), FieldValue::Bool(true));
    }

    #[test]
    fn escaped_keys_round_trip() {
        let mut p = point("heatload delta,t", "delta t=1", FieldValue::Float(1.5));
        p.tags = TagSet::from([("tag key".to_string(), "v,1".to_string())]);
        let text = serialize_points(&[p.clone()]).unwrap().join("\n");
        let parsed = parse_line_protocol(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].measurement, p.measurement);
        assert_eq!(parsed[0].field, p.field);
        assert_eq!(parsed[0].tags, p.tags);
    }

    #[test]
    fn newline_in_text_value_round_trips() {
        let p = point(
            "miscellaneous",
            "operator_remark",
            FieldValue::Text("line one\nline two".into()),
        );
        let lines = serialize_points(&[p]).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains('\n'));

        let parsed = parse_line_protocol(&lines.join("\n")).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].value,
            FieldValue::Text("line one\nline two".into())
        );
    }

    #[test]
    fn missing_values_are_never_serialized() {
        let points = vec![
            point("process_params", "pressure", FieldValue::Missing),
            point("process_params", "o2_enrichment", FieldValue::Float(4.0)),
        ];
        let lines = serialize_points(&points).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains("pressure"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_line_protocol("nonsense without sections").is_err());
        assert!(parse_line_protocol("m badfield 123").is_err());
    }

    #[test]
    fn stager_retain_gzips_and_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let mut stager = Stager::create(dir.path(), 4242).unwrap();
        let tmp = stager.path().to_path_buf();
        let n = stager
            .stage(&[point("process_params", "pressure", FieldValue::Float(2.1))])
            .unwrap();
        assert_eq!(n, 1);
        assert!(tmp.exists());

        let final_path = stager.finalize(Some("date_2025-05-24_range2")).unwrap().unwrap();
        assert!(final_path.ends_with("date_2025-05-24_range2.txt.gz"));
        assert!(final_path.exists());
        assert!(!tmp.exists());

        // The gzipped content parses back to the staged point.
        let mut decoder = flate2::read::GzDecoder::new(File::open(&final_path).unwrap());
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        let parsed = parse_line_protocol(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].field, "pressure");
    }

    #[test]
    fn stager_discard_deletes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let mut stager = Stager::create(dir.path(), 7).unwrap();
        stager
            .stage(&[point("process_params", "pressure", FieldValue::Float(2.1))])
            .unwrap();
        let tmp = stager.path().to_path_buf();
        assert_eq!(stager.finalize(None).unwrap(), None);
        assert!(!tmp.exists());
    }

    #[test]
    fn stager_drop_cleans_up_without_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = {
            let mut stager = Stager::create(dir.path(), 99).unwrap();
            stager
                .stage(&[point("process_params", "pressure", FieldValue::Float(2.1))])
                .unwrap();
            stager.path().to_path_buf()
        };
        assert!(!tmp.exists());
    }
}
