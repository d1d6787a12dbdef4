//! Workflow orchestration engine for Stepflow.
//!
//! Registers workflow definitions, resolves step dependencies, runs steps
//! through injected executors with retry and backoff, and admits executions
//! under a global concurrency cap. Persistence is reached only through the
//! `ExecutionStore` port in [`repository`].

pub mod config;
pub mod event;
pub mod health;
pub mod repository;
pub mod workflow;

pub use workflow::engine::WorkflowEngine;
pub use workflow::step::{BoxStepExecutor, StepExecutor, StepInput};
