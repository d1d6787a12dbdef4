//! Workflow orchestration: definitions, dependency resolution, step
//! execution with retry, admission scheduling, and the coordinating engine.

pub mod dag;
pub mod definition;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod step;
