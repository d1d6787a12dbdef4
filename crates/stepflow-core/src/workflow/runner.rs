//! Task executor: runs one step through its retry policy.
//!
//! Each attempt is bounded by the step timeout; a timed-out attempt is
//! dropped and counts as a failure. Every failure reason is appended to the
//! step's log trail. Between attempts the runner sleeps for the policy's
//! backoff delay, and stops scheduling further attempts once the owning
//! execution is cancelled. The attempt in flight is never interrupted by
//! cancellation.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use stepflow_types::event::EngineEvent;
use stepflow_types::execution::{StepLogLine, StepStatus};
use stepflow_types::value::{ParamValue, Parameters};
use stepflow_types::workflow::{RetryPolicy, StepDefinition};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;

use super::error::StepError;
use super::retry::RetryHandler;
use super::step::{BoxStepExecutor, StepInput};

/// Execution-scoped context the runner needs for one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub inputs: Parameters,
    pub dependency_results: BTreeMap<String, ParamValue>,
    pub cancel: CancellationToken,
    pub events: EventBus,
}

/// Terminal outcome of running one step.
#[derive(Debug, Clone)]
pub struct StepRun {
    /// `Completed` or `Failed`.
    pub status: StepStatus,
    pub attempts: u32,
    pub result: Option<ParamValue>,
    pub error: Option<String>,
    pub logs: Vec<StepLogLine>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs steps against their executors.
pub struct TaskRunner;

impl TaskRunner {
    /// Run `step` until it succeeds or its attempts are exhausted.
    pub async fn run_step(
        step: &StepDefinition,
        executor: &BoxStepExecutor,
        policy: &RetryPolicy,
        timeout: Duration,
        ctx: &StepContext,
    ) -> StepRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut logs = Vec::new();
        let mut attempt = 0;

        let (status, result, error) = loop {
            attempt += 1;
            ctx.events.publish(EngineEvent::StepStarted {
                execution_id: ctx.execution_id,
                step_id: step.id.clone(),
                attempt,
            });
            logs.push(StepLogLine::now(format!(
                "attempt {attempt}/{max_attempts} started"
            )));

            let input = StepInput {
                execution_id: ctx.execution_id,
                workflow_id: ctx.workflow_id.clone(),
                step_id: step.id.clone(),
                attempt,
                parameters: step.parameters.clone(),
                inputs: ctx.inputs.clone(),
                dependency_results: ctx.dependency_results.clone(),
            };

            let err = match Self::attempt(executor, &input, timeout).await {
                Ok(value) => {
                    logs.push(StepLogLine::now(format!("attempt {attempt} succeeded")));
                    break (StepStatus::Completed, Some(value), None);
                }
                Err(err) => err,
            };

            tracing::warn!(
                execution_id = %ctx.execution_id,
                step_id = step.id.as_str(),
                attempt,
                max_attempts,
                error = %err,
                "step attempt failed"
            );
            logs.push(StepLogLine::now(format!("attempt {attempt} failed: {err}")));

            if !RetryHandler::should_retry(policy, attempt) {
                break (StepStatus::Failed, None, Some(err.to_string()));
            }
            if ctx.cancel.is_cancelled() {
                logs.push(StepLogLine::now("retries abandoned: execution cancelled"));
                break (StepStatus::Failed, None, Some(err.to_string()));
            }

            let delay = RetryHandler::backoff_delay(policy, attempt - 1);
            let delay_ms = delay.as_millis() as u64;
            ctx.events.publish(EngineEvent::StepRetrying {
                execution_id: ctx.execution_id,
                step_id: step.id.clone(),
                attempt,
                delay_ms,
                error: err.to_string(),
            });
            logs.push(StepLogLine::now(format!("retrying in {delay_ms}ms")));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => {
                    logs.push(StepLogLine::now("retries abandoned: execution cancelled"));
                    break (StepStatus::Failed, None, Some(err.to_string()));
                }
            }
        };

        StepRun {
            status,
            attempts: attempt,
            result,
            error,
            logs,
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        }
    }

    /// One bounded attempt. Panics inside the executor become failures.
    async fn attempt(
        executor: &BoxStepExecutor,
        input: &StepInput,
        timeout: Duration,
    ) -> Result<ParamValue, StepError> {
        let guarded = AssertUnwindSafe(executor.execute(input)).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(
                    execution_id = %input.execution_id,
                    step_id = input.step_id.as_str(),
                    attempt = input.attempt,
                    panic = msg.as_str(),
                    "step executor panicked"
                );
                Err(StepError::Panicked(msg))
            }
            Err(_) => Err(StepError::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
