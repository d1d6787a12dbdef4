//! Persistence port for definitions and execution snapshots.
//!
//! The engine keeps all live state in memory; the store only receives
//! definitions as they are registered and executions once they finish.

pub mod execution;
pub mod memory;
