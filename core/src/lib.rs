//! Cancellation-safe orchestration of asynchronous resource loads.
//!
//! This crate is the concurrency core behind UI-bound data loading. It deals
//! in [`Outcome`](loadstone_types::Outcome) streams and provides three
//! building blocks that compose freely:
//!
//! | Entry point | Purpose |
//! |-------------|---------|
//! | [`ResourceController`] | Keyed single-flight jobs: a new launch for a key supersedes the old one |
//! | [`share`] | Reference-counted multicast of a cold producer, with conflation and debounced teardown |
//! | [`prevent_blinking`] | Presentation-timing filter that suppresses loading-state flicker |
//!
//! All three are safe under concurrent callers; the start/stop decisions that
//! must not race are taken under per-owner locks, never through globals.

mod blink;
mod reporter;
mod resource;
mod share;

pub use blink::{BlinkConfig, BlinkStream, prevent_blinking};
pub use reporter::LogReporter;
pub use resource::{JobId, OutcomeSink, ResourceController, TaskCx};
pub use share::{Attachment, ColdProducer, Shared, SharingConfig, share};
