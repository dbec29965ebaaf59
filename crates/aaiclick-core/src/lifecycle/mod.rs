//! Table lifecycle handlers.
//!
//! A lifecycle handler is the incref/decref sink co-scoped with a data
//! context. Two implementations share the contract:
//!
//! - [`LocalLifecycle`]: in-process refcounts, drops a table the moment its
//!   count hits zero. The default when nothing is injected.
//! - [`DistributedLifecycle`]: writes refcount deltas to the state store and
//!   never drops anything; the cleanup sweeper reclaims storage out of band.
//!
//! Refcount tracking (hot, inline) and table dropping (cold, periodic)
//! deliberately do not share a code path.

mod distributed;
mod local;

pub use distributed::DistributedLifecycle;
pub use local::{LocalLifecycle, TableDropper};

/// A message on a handler's internal queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleMessage {
    Incref(String),
    Decref(String),
    /// Sentinel: drain and exit. Queue order guarantees every delta sent
    /// before `stop()` is applied first.
    Shutdown,
}

/// The lifecycle handler contract.
///
/// `incref`/`decref` MUST be non-blocking and safe to call from any thread,
/// including `Drop` implementations during shutdown: they only enqueue, and
/// both become no-ops once the handler is closed. `stop()` drains pending
/// operations and returns only after all of them are durably applied.
pub trait LifecycleHandler: Send + Sync {
    /// Start the consumer. Idempotent.
    fn start(&self);

    /// Signal shutdown and block until the queue is drained. Idempotent.
    fn stop(&self);

    /// Record one new reference to a table. Never blocks.
    fn incref(&self, table_name: &str);

    /// Release one reference to a table. Never blocks.
    fn decref(&self, table_name: &str);
}
