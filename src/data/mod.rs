//! External collaborators: the upstream API and the time-series store.
//!
//! The core pipeline only depends on the shapes exposed here (`DataSource`,
//! `StoreClient`); the concrete HTTP plumbing stays in this module.

pub mod api;
pub mod store;

pub use api::*;
pub use store::*;
