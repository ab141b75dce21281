//! Per-point write decision.
//!
//! With `override` set, writes are unconditional: the store's last-write-wins
//! behavior on identical natural keys handles replacement. Without
//! `override`, the decision defers to an existence check against the store.
//! That check is not implemented upstream; the default checker reports every
//! point as absent and warns once per run so the gap stays visible instead of
//! being silently "correct".

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::domain::Point;
use crate::error::AppError;

/// Existence check against the store for one point's natural key.
///
/// Implementations must be side-effect free beyond the query itself; the gate
/// calls this at most once per point.
pub trait ExistenceCheck {
    fn exists(&self, point: &Point) -> Result<bool, AppError>;
}

/// Default checker: reports every point as absent.
///
/// TODO: replace with a real store query once the existence/delta check is
/// specified (the upstream design left it open).
#[derive(Debug, Default)]
pub struct PassThroughCheck {
    warned: AtomicBool,
}

impl ExistenceCheck for PassThroughCheck {
    fn exists(&self, _point: &Point) -> Result<bool, AppError> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("Existence check is not implemented; writing without override behaves as write-always.");
        }
        Ok(false)
    }
}

/// Decide whether `point` should be written to the store.
pub fn should_write(
    point: &Point,
    override_existing: bool,
    checker: &dyn ExistenceCheck,
) -> Result<bool, AppError> {
    if override_existing {
        return Ok(true);
    }
    Ok(!checker.exists(point)?)
}
