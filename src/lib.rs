//! `bf-ingest` library crate.
//!
//! The binary (`bfi`) is a thin wrapper around this library so that:
//!
//! - core pipeline logic is testable without spawning processes
//! - modules are reusable (e.g., future schedulers, replay tools, etc.)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod clean;
pub mod cli;
pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod gate;
pub mod mapping;
pub mod points;
pub mod report;
pub mod stage;
pub mod track;
