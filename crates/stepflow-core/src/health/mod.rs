//! Health tracking for periodic and flaky operations.

pub mod backoff;

pub use backoff::{BackoffController, BackoffError, BackoffStatus, RunOutcome};
