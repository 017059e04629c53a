//! The three-state outcome of an asynchronous resource load.

use crate::Cause;
use std::error::Error as StdError;
use std::sync::Arc;

/// Presentation hint attached to [`Outcome::Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProgressStyle {
    /// Regular in-flight load.
    #[default]
    Normal,
    /// Loading more data on top of data already shown (e.g. pagination).
    AdditionalData,
    /// The user explicitly asked for a refresh; UIs typically render this
    /// as a pull-to-refresh spinner rather than a full-screen placeholder.
    UserRequestedRefresh,
}

/// State of an asynchronous load, always carrying the last known data.
///
/// Transitions are represented by emitting a new `Outcome` on a stream;
/// values are never mutated in place. Every variant exposes the most recent
/// data through [`Outcome::data`], so a consumer can keep rendering stale
/// content while a refresh is in flight or after it failed.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Work is in flight. `data` is whatever was known before (if anything),
    /// `fraction` an optional completion ratio in `0..=1`.
    Progress {
        /// Last known data, shown while loading.
        data: Option<T>,
        /// Completion ratio in `0..=1`, when the producer can estimate one.
        fraction: Option<f32>,
        /// Presentation hint for the loading state.
        style: ProgressStyle,
    },
    /// Work finished with a value.
    Success {
        /// The loaded data.
        data: T,
    },
    /// Work failed. `data` retains the value known before the failure.
    Error {
        /// What went wrong.
        cause: Cause,
        /// Last known data, retained across the failure.
        data: Option<T>,
    },
}

impl<T> Outcome<T> {
    /// A plain in-flight marker with optional seed data.
    pub fn progress(data: Option<T>) -> Self {
        Outcome::Progress {
            data,
            fraction: None,
            style: ProgressStyle::Normal,
        }
    }

    /// An in-flight marker with an explicit completion ratio and style.
    pub fn progress_with(data: Option<T>, fraction: Option<f32>, style: ProgressStyle) -> Self {
        Outcome::Progress {
            data,
            fraction,
            style,
        }
    }

    /// A successful terminal outcome.
    pub fn success(data: T) -> Self {
        Outcome::Success { data }
    }

    /// A failed terminal outcome retaining optional stale data.
    pub fn failure(cause: Cause, data: Option<T>) -> Self {
        Outcome::Error { cause, data }
    }

    /// A failed terminal outcome built from any error value, with no data.
    pub fn failure_from(err: impl StdError + Send + Sync + 'static) -> Self {
        Outcome::Error {
            cause: Arc::new(err),
            data: None,
        }
    }

    /// The last known data, regardless of variant.
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        match self {
            Outcome::Progress { data, .. } | Outcome::Error { data, .. } => data.as_ref(),
            Outcome::Success { data } => Some(data),
        }
    }

    /// Consume the outcome, returning the last known data.
    #[must_use]
    pub fn into_data(self) -> Option<T> {
        match self {
            Outcome::Progress { data, .. } | Outcome::Error { data, .. } => data,
            Outcome::Success { data } => Some(data),
        }
    }

    /// The failure cause, if this is an [`Outcome::Error`].
    #[must_use]
    pub fn error_cause(&self) -> Option<&Cause> {
        match self {
            Outcome::Error { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// True for [`Outcome::Progress`].
    #[must_use]
    pub fn is_progress(&self) -> bool {
        matches!(self, Outcome::Progress { .. })
    }

    /// True for [`Outcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// True for [`Outcome::Error`].
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }

    /// True for the terminal variants (`Success` or `Error`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_progress()
    }

    /// Map the data in every slot, preserving variant, cause and timing
    /// metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Progress {
                data,
                fraction,
                style,
            } => Outcome::Progress {
                data: data.map(f),
                fraction,
                style,
            },
            Outcome::Success { data } => Outcome::Success { data: f(data) },
            Outcome::Error { cause, data } => Outcome::Error {
                cause,
                data: data.map(f),
            },
        }
    }

    /// Downgrade a `Success` into a `Progress` carrying the same data.
    ///
    /// Used when a refresh starts over data that is already known: the value
    /// stays on screen while the new load runs. `Progress` and `Error` pass
    /// through unchanged.
    #[must_use]
    pub fn downgrade(self, style: ProgressStyle) -> Self {
        match self {
            Outcome::Success { data } => Outcome::Progress {
                data: Some(data),
                fraction: None,
                style,
            },
            other => other,
        }
    }

    /// Fill an empty data slot from a previously known value.
    ///
    /// `Success` never changes; `Progress`/`Error` only gain data when their
    /// own slot is empty.
    #[must_use]
    pub fn with_fallback_data(self, fallback: Option<T>) -> Self {
        match self {
            Outcome::Progress {
                data: None,
                fraction,
                style,
            } => Outcome::Progress {
                data: fallback,
                fraction,
                style,
            },
            Outcome::Error { cause, data: None } => Outcome::Error {
                cause,
                data: fallback,
            },
            other => other,
        }
    }
}
