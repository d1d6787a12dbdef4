//! Logging and trace export setup for Stepflow binaries and tests.

pub mod tracing_setup;
