//! Error taxonomy for registration, execution and step attempts.

use stepflow_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

/// A dependency cycle, named by one of the steps on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected at step '{step_id}'")]
pub struct CycleError {
    pub step_id: String,
}

/// Failure to compute an execution order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// Registration-time rejection of a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflowId(String),

    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("step '{step}' references unknown executor '{executor}'")]
    UnknownExecutor { step: String, executor: String },

    #[error("step '{step}' has invalid parameters: {reason}")]
    InvalidParameter { step: String, reason: String },

    #[error("invalid retry policy on '{scope}': {reason}")]
    InvalidRetryPolicy { scope: String, reason: String },

    #[error("invalid timeout on '{scope}': must be greater than zero")]
    InvalidTimeout { scope: String },

    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<ResolveError> for ValidationError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownDependency { step, dependency } => {
                ValidationError::UnknownDependency { step, dependency }
            }
            ResolveError::Cycle(cycle) => ValidationError::Cycle(cycle),
        }
    }
}

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow '{workflow_id}' has {active} pending or running execution(s)")]
    WorkflowInUse { workflow_id: String, active: usize },

    #[error("execution {0} has not finished")]
    ExecutionNotFinished(Uuid),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is shut down")]
    ShutDown,

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),
}

/// Failure of a single step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The executor reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The executor rejected its parameters.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("attempt timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_step() {
        let err = ValidationError::from(CycleError {
            step_id: "x".to_string(),
        });
        assert_eq!(err.to_string(), "dependency cycle detected at step 'x'");
    }

    #[test]
    fn test_resolve_error_maps_to_validation() {
        let err = ValidationError::from(ResolveError::UnknownDependency {
            step: "b".to_string(),
            dependency: "zz".to_string(),
        });
        assert!(matches!(err, ValidationError::UnknownDependency { .. }));
        assert!(err.to_string().contains("zz"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::WorkflowInUse {
            workflow_id: "recon".to_string(),
            active: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("recon"), "got: {msg}");
        assert!(msg.contains('2'), "got: {msg}");
    }

    #[test]
    fn test_step_error_display() {
        assert_eq!(
            StepError::TimedOut { timeout_ms: 50 }.to_string(),
            "attempt timed out after 50ms"
        );
        assert_eq!(StepError::failed("boom").to_string(), "boom");
    }
}
