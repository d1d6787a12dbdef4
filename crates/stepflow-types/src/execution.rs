//! Execution tracking types.
//!
//! An `Execution` is one run of a `WorkflowDefinition`. It owns a `StepTable`
//! holding one `StepExecution` per declared step, plus aggregate metrics.
//! Records are snapshots: the engine hands out clones and never shares the
//! live record.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{ParamValue, Parameters};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the execution can no longer change status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a dependent of a step in this status must be skipped.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Trigger metadata
// ---------------------------------------------------------------------------

/// What kind of event started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Conditional,
}

/// Who or what triggered an execution, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub triggered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7, time-sortable.
    pub id: Uuid,
    pub workflow_id: String,
    /// Version of the definition snapshot this execution runs.
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub trigger: TriggerInfo,
    /// Input bindings supplied when the execution was started.
    #[serde(default)]
    pub inputs: Parameters,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: StepTable,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    /// Summary of why the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reason supplied with a cancellation request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl Execution {
    /// Create a pending execution with one pending step record per step id.
    pub fn new<'a>(
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        step_ids: impl IntoIterator<Item = &'a str>,
        inputs: Parameters,
        trigger: TriggerInfo,
    ) -> Self {
        let steps = StepTable::new(step_ids);
        let metrics = ExecutionMetrics {
            total_steps: steps.len() as u32,
            ..ExecutionMetrics::default()
        };
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            trigger,
            inputs,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            steps,
            metrics,
            error: None,
            cancel_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, once both timestamps are recorded.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Step table
// ---------------------------------------------------------------------------

/// Arena of step records in declaration order, indexed by step id.
///
/// Serialized as a plain list; the index is rebuilt on deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<StepExecution>", into = "Vec<StepExecution>")]
pub struct StepTable {
    slots: Vec<StepExecution>,
    index: HashMap<String, usize>,
}

impl StepTable {
    pub fn new<'a>(step_ids: impl IntoIterator<Item = &'a str>) -> Self {
        step_ids
            .into_iter()
            .map(StepExecution::pending)
            .collect::<Vec<_>>()
            .into()
    }

    pub fn get(&self, step_id: &str) -> Option<&StepExecution> {
        self.index.get(step_id).map(|&i| &self.slots[i])
    }

    pub fn get_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        match self.index.get(step_id) {
            Some(&i) => self.slots.get_mut(i),
            None => None,
        }
    }

    /// Status of a step, if it exists.
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.get(step_id).map(|s| s.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepExecution> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StepExecution> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Count the steps currently in `status`.
    pub fn count(&self, status: StepStatus) -> usize {
        self.slots.iter().filter(|s| s.status == status).count()
    }
}

impl From<Vec<StepExecution>> for StepTable {
    fn from(slots: Vec<StepExecution>) -> Self {
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.clone(), i))
            .collect();
        Self { slots, index }
    }
}

impl From<StepTable> for Vec<StepExecution> {
    fn from(table: StepTable) -> Self {
        table.slots
    }
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Per-step run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempts made so far (0 until the step first runs).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Append-only log trail.
    #[serde(default)]
    pub logs: Vec<StepLogLine>,
}

impl StepExecution {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            result: None,
            error: None,
            duration_ms: None,
            logs: Vec::new(),
        }
    }

    /// Number of retries made after the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(StepLogLine::now(message));
    }
}

/// A timestamped line in a step's log trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl StepLogLine {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregate counters for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    /// Executor invocations across all steps.
    pub total_attempts: u32,
    pub total_retries: u32,
    /// Sum of durations of steps that ran (completed or failed).
    pub total_step_duration_ms: u64,
    /// Running average over steps that ran.
    pub average_step_duration_ms: f64,
}

impl ExecutionMetrics {
    /// Fold a step that just reached a terminal status into the counters.
    pub fn record(&mut self, step: &StepExecution) {
        match step.status {
            StepStatus::Completed => self.completed_steps += 1,
            StepStatus::Failed => self.failed_steps += 1,
            StepStatus::Skipped => {
                self.skipped_steps += 1;
                return;
            }
            StepStatus::Pending | StepStatus::Running => return,
        }
        self.total_attempts += step.attempts;
        self.total_retries += step.retry_count();
        self.total_step_duration_ms += step.duration_ms.unwrap_or(0);
        let ran = self.completed_steps + self.failed_steps;
        self.average_step_duration_ms = self.total_step_duration_ms as f64 / f64::from(ran);
    }
}
