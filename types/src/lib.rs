//! Core domain types for Loadstone.
//!
//! This crate contains pure domain types with no IO and no async: the
//! [`Outcome`] model shared by every layer of the load pipeline, the
//! [`Cause`] alias used to hand error chains across task and fan-out
//! boundaries, and the [`ErrorReporter`] collaborator contract.

mod outcome;

pub use outcome::{Outcome, ProgressStyle};

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error causes
// ============================================================================

/// A shared, cloneable error cause.
///
/// Outcomes fan out to many consumers and hop between tasks, so causes are
/// reference-counted rather than owned. Any `std::error::Error` fits; the
/// source chain is preserved.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Wrap an error value into a [`Cause`].
pub fn cause(err: impl StdError + Send + Sync + 'static) -> Cause {
    Arc::new(err)
}

/// A plain-text error cause for callers without a structured error type.
///
/// Mostly useful in tests and at the edges where only a message survives
/// (e.g. an error forwarded from a foreign reporting pipeline).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MessageError(pub String);

impl MessageError {
    /// Build a [`Cause`] directly from a message.
    pub fn caused(msg: impl Into<String>) -> Cause {
        Arc::new(Self(msg.into()))
    }
}

// ============================================================================
// Error reporting collaborator
// ============================================================================

/// Fire-and-forget sink for errors that are intercepted rather than surfaced
/// on an outcome stream.
///
/// Invoked for suppressed cache-read failures and for task errors that were
/// already converted into an [`Outcome::Error`]. Implementations must not
/// block and must not panic.
pub trait ErrorReporter: Send + Sync {
    /// Report an intercepted error.
    fn report(&self, cause: &Cause);
}

/// Reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _cause: &Cause) {}
}

impl<R: ErrorReporter + ?Sized> ErrorReporter for Arc<R> {
    fn report(&self, cause: &Cause) {
        (**self).report(cause);
    }
}
