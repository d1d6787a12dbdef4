//! Shared domain types for Stepflow.
//!
//! Workflow definitions, parameter values, execution records, engine events
//! and configuration. Zero infrastructure dependencies -- only serde, uuid,
//! chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod value;
pub mod workflow;
