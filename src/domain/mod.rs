//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - typed scalar values (`FieldValue`) with an explicit "no value" variant
//! - normalized per-timestamp records (`CleanedRecord`)
//! - uniquely-keyed time-series points (`Point`)
//! - per-invocation run configuration (`RunContext`, `Mode`)

pub mod types;

pub use types::*;
