//! Default error-reporting collaborator backed by `tracing`.

use loadstone_types::{Cause, ErrorReporter};

/// Reporter that logs every intercepted error at `warn` level.
///
/// Intercepted errors are the ones that never reach an outcome stream on
/// their own (suppressed cache failures) or were already converted into an
/// `Outcome::Error`; logging is the floor of observability for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, cause: &Cause) {
        tracing::warn!(error = %cause, "intercepted load error");
    }
}
