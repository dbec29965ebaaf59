//! Typed domain errors.
//!
//! Plumbing-level failures travel as `anyhow::Error` with context; these are
//! the conditions callers are expected to match on.

use thiserror::Error;

/// The system clock regressed below the last timestamp the ID generator
/// observed. Fatal to the caller: continuing would risk duplicate IDs.
#[derive(Debug, Clone, Error)]
#[error("clock moved backwards: last observed {last_ms}ms, now {now_ms}ms")]
pub struct ClockMovedBackwards {
    pub last_ms: u64,
    pub now_ms: u64,
}

/// A data-context handle (or an object registered under it) was used after
/// its scope exited.
#[derive(Debug, Clone, Error)]
#[error("data context is stale: {0}")]
pub struct StaleObject(pub String);

/// The task's entrypoint does not name a registered callback.
#[derive(Debug, Clone, Error)]
#[error("entrypoint {0:?} is not registered")]
pub struct EntrypointResolutionError(pub String);

/// The task's kwargs blob is malformed: not an object, or a parameter is
/// missing its `object_type`/`table_id` tags.
#[derive(Debug, Clone, Error)]
#[error("invalid task parameter: {0}")]
pub struct ParameterError(pub String);
