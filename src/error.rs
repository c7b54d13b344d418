//! Error types surfaced by the context pool.

use std::time::Duration;
use uuid::Uuid;

use crate::driver::DriverError;

/// Errors produced by pool operations.
///
/// Each variant has a distinct identity so the HTTP edge can map it to a
/// status class without string matching.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// An operation was attempted before the pool was started.
    #[error("pool not started")]
    NotStarted,

    /// The referenced context does not exist.
    #[error("context not found: {0}")]
    ContextNotFound(Uuid),

    /// Acquire was attempted on a context that is already in use.
    #[error("context {0} is not available (already in use)")]
    ContextNotAvailable(Uuid),

    /// Remove was attempted on a context that is currently acquired.
    #[error("cannot remove context {0} while it is in use")]
    ContextInUse(Uuid),

    /// The pool is at capacity and a plain create cannot proceed.
    #[error("pool is full ({0} contexts)")]
    PoolFull(usize),

    /// A queued request waited longer than the configured limit.
    #[error("no context available after {}s", .0.as_secs())]
    QueueTimeout(Duration),

    /// The browser layer failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// Whether this error means the browser process itself is gone.
    #[must_use]
    pub fn is_driver_crash(&self) -> bool {
        matches!(self, Self::Driver(e) if e.is_crash())
    }
}

/// Convenience alias used throughout the pool modules.
pub type PoolResult<T> = Result<T, PoolError>;
