//! Engine lifecycle events.
//!
//! `EngineEvent` is the single event vocabulary emitted by the engine:
//! execution and step transitions from the coordinator, plus attempt and
//! cool-off transitions from backoff controllers. Consumers (monitoring,
//! alerting, UIs) subscribe through the core crate's event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution and by backoff controllers.
///
/// Serialized with `#[serde(tag = "type")]` so consumers can dispatch on the
/// `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // -- Execution lifecycle --

    /// An execution was created and handed to the scheduler.
    ExecutionQueued {
        execution_id: Uuid,
        workflow_id: String,
    },

    /// An execution was admitted and began running.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
    },

    /// Every step completed.
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        completed_steps: u32,
    },

    /// At least one step failed.
    ExecutionFailed {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        error: String,
    },

    /// The execution was cancelled (explicitly or by its time limit).
    ExecutionCancelled {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        reason: String,
    },

    // -- Step lifecycle --

    StepStarted {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    /// An attempt failed and another will follow after `delay_ms`.
    StepRetrying {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
        attempts: u32,
    },

    /// Attempts were exhausted.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
        attempts: u32,
        error: String,
    },

    /// The step never ran.
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },

    // -- Backoff controller --

    BackoffAttempt {
        source: String,
        attempt: u32,
    },

    BackoffFailure {
        source: String,
        attempt: u32,
        consecutive_failures: u32,
        error: String,
    },

    CoolOffEntered {
        source: String,
        duration_ms: u64,
    },

    CoolOffExited {
        source: String,
    },
}

impl EngineEvent {
    /// The execution this event belongs to, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::ExecutionQueued { execution_id, .. }
            | EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id, .. }
            | EngineEvent::StepStarted { execution_id, .. }
            | EngineEvent::StepRetrying { execution_id, .. }
            | EngineEvent::StepCompleted { execution_id, .. }
            | EngineEvent::StepFailed { execution_id, .. }
            | EngineEvent::StepSkipped { execution_id, .. } => Some(*execution_id),
            EngineEvent::BackoffAttempt { .. }
            | EngineEvent::BackoffFailure { .. }
            | EngineEvent::CoolOffEntered { .. }
            | EngineEvent::CoolOffExited { .. } => None,
        }
    }

    /// The step this event belongs to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EngineEvent::StepStarted { step_id, .. }
            | EngineEvent::StepRetrying { step_id, .. }
            | EngineEvent::StepCompleted { step_id, .. }
            | EngineEvent::StepFailed { step_id, .. }
            | EngineEvent::StepSkipped { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Whether this event closes out an execution.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::ExecutionCompleted { .. }
                | EngineEvent::ExecutionFailed { .. }
                | EngineEvent::ExecutionCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_serde_tag() {
        let event = EngineEvent::StepFailed {
            execution_id: Uuid::now_v7(),
            step_id: "b".to_string(),
            duration_ms: 12,
            attempts: 3,
            error: "boom".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_failed\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::StepFailed { attempts: 3, .. }));
    }

    #[test]
    fn test_cool_off_entered_serde_tag() {
        let event = EngineEvent::CoolOffEntered {
            source: "health-probe".to_string(),
            duration_ms: 60_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"cool_off_entered\""));
    }

    #[test]
    fn test_accessors() {
        let id = Uuid::now_v7();
        let event = EngineEvent::StepSkipped {
            execution_id: id,
            step_id: "c".to_string(),
            reason: "dependency 'b' failed".to_string(),
        };
        assert_eq!(event.execution_id(), Some(id));
        assert_eq!(event.step_id(), Some("c"));
        assert!(!event.is_execution_terminal());

        let done = EngineEvent::ExecutionCompleted {
            execution_id: id,
            workflow_id: "wf".to_string(),
            duration_ms: 5,
            completed_steps: 3,
        };
        assert!(done.is_execution_terminal());
        assert_eq!(done.step_id(), None);

        let probe = EngineEvent::CoolOffExited {
            source: "probe".to_string(),
        };
        assert_eq!(probe.execution_id(), None);
    }
}
