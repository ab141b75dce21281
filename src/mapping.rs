//! The field-mapping table.
//!
//! A load-once, read-only table describing how raw API variable names map to
//! canonical field names, declared types, and measurement groups. Loaded from
//! a YAML artifact at process start and passed explicitly to the cleaner and
//! point builder (never ambient global state), so the pipeline stays testable
//! with injected mappings.
//!
//! YAML shape:
//!
//! ```yaml
//! measurements:
//!   temperature_profile:
//!     "Furnace Top Temp 1": furnace_top_temp_1
//!   process_params:
//!     "Hot Blast Pressure": hot_blast_pressure
//! # canonical names forced to a non-float type (default is float):
//! string_fields: [hot_blast_temp_spare]
//! int_fields: []
//! bool_fields: []
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::domain::FieldKind;
use crate::error::AppError;

/// Mapping entry for one raw field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub raw: String,
    pub canonical: String,
    pub measurement: String,
    pub kind: FieldKind,
}

/// The full mapping table. Raw and canonical names are both unique keys.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    specs: Vec<FieldSpec>,
    by_raw: HashMap<String, usize>,
    by_canonical: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    measurements: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    string_fields: BTreeSet<String>,
    #[serde(default)]
    int_fields: BTreeSet<String>,
    #[serde(default)]
    bool_fields: BTreeSet<String>,
}

impl FieldMapping {
    /// Load the table from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|e| {
            AppError::usage(format!(
                "Failed to open field mappings '{}': {e}",
                path.display()
            ))
        })?;
        let raw: MappingFile = serde_yaml::from_reader(file)
            .map_err(|e| AppError::usage(format!("Invalid field mappings YAML: {e}")))?;
        Self::from_file_model(raw)
    }

    /// Parse the table from YAML text. Used by tests and embedded configs.
    pub fn from_yaml_str(text: &str) -> Result<Self, AppError> {
        let raw: MappingFile = serde_yaml::from_str(text)
            .map_err(|e| AppError::usage(format!("Invalid field mappings YAML: {e}")))?;
        Self::from_file_model(raw)
    }

    fn from_file_model(raw: MappingFile) -> Result<Self, AppError> {
        let mut specs = Vec::new();
        let mut by_raw = HashMap::new();
        let mut by_canonical = HashMap::new();

        for (measurement, fields) in raw.measurements {
            for (raw_name, canonical) in fields {
                let kind = if raw.string_fields.contains(&canonical) {
                    FieldKind::String
                } else if raw.int_fields.contains(&canonical) {
                    FieldKind::Int
                } else if raw.bool_fields.contains(&canonical) {
                    FieldKind::Bool
                } else {
                    FieldKind::Float
                };

                let idx = specs.len();
                if by_raw.insert(raw_name.clone(), idx).is_some() {
                    return Err(AppError::usage(format!(
                        "Duplicate raw field name '{raw_name}' in field mappings."
                    )));
                }
                if by_canonical.insert(canonical.clone(), idx).is_some() {
                    return Err(AppError::usage(format!(
                        "Duplicate canonical field name '{canonical}' in field mappings."
                    )));
                }
                specs.push(FieldSpec {
                    raw: raw_name,
                    canonical,
                    measurement: measurement.clone(),
                    kind,
                });
            }
        }

        if specs.is_empty() {
            return Err(AppError::usage("Field mappings contain no fields."));
        }

        Ok(Self {
            specs,
            by_raw,
            by_canonical,
        })
    }

    /// Look up the spec for a raw API field name.
    pub fn by_raw(&self, raw_name: &str) -> Option<&FieldSpec> {
        self.by_raw.get(raw_name).map(|&i| &self.specs[i])
    }

    /// Look up the spec for a canonical field name.
    pub fn by_canonical(&self, canonical: &str) -> Option<&FieldSpec> {
        self.by_canonical.get(canonical).map(|&i| &self.specs[i])
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
measurements:
  temperature_profile:
    "Furnace Top Temp 1": furnace_top_temp_1
    "Hot Blast Temp Spare": hot_blast_temp_spare
  process_params:
    "Hot Blast Pressure": hot_blast_pressure
string_fields: [hot_blast_temp_spare]
"#;

    #[test]
    fn loads_groups_and_types() {
        let mapping = FieldMapping::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(mapping.len(), 3);
        assert!(!mapping.is_empty());

        let spec = mapping.by_raw("Furnace Top Temp 1").unwrap();
        assert_eq!(spec.canonical, "furnace_top_temp_1");
        assert_eq!(spec.measurement, "temperature_profile");
        assert_eq!(spec.kind, FieldKind::Float);

        let spare = mapping.by_canonical("hot_blast_temp_spare").unwrap();
        assert_eq!(spare.kind, FieldKind::String);
        assert_eq!(spare.raw, "Hot Blast Temp Spare");

        assert!(mapping.by_raw("Unknown Variable").is_none());
    }

    #[test]
    fn rejects_duplicate_raw_names() {
        let dup = r#"
measurements:
  a:
    "Same Raw": one
  b:
    "Same Raw": two
"#;
        let err = FieldMapping::from_yaml_str(dup).unwrap_err();
        assert!(err.to_string().contains("Duplicate raw field name"));
    }

    #[test]
    fn rejects_duplicate_canonical_names() {
        let dup = r#"
measurements:
  a:
    "Raw One": same_canonical
  b:
    "Raw Two": same_canonical
"#;
        let err = FieldMapping::from_yaml_str(dup).unwrap_err();
        assert!(err.to_string().contains("Duplicate canonical field name"));
    }

    #[test]
    fn rejects_empty_table() {
        let err = FieldMapping::from_yaml_str("measurements: {}").unwrap_err();
        assert!(err.to_string().contains("no fields"));
    }
}
