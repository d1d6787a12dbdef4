//! Engine configuration types.
//!
//! `StepflowConfig` mirrors the `stepflow.toml` file. Every field has a
//! default so a missing or partial file still yields a usable config.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Execution coordinator and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum executions in Running state at once.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Steps of one execution allowed to run at once. 1 runs steps strictly
    /// one after another in dependency order.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// How often the admission loop re-checks the queue when not woken.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-attempt timeout for steps that do not declare one.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry policy for steps when neither the step nor its workflow sets one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

fn default_max_concurrent_executions() -> usize {
    5
}

fn default_max_parallel_steps() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            max_parallel_steps: default_max_parallel_steps(),
            poll_interval_ms: default_poll_interval_ms(),
            default_step_timeout_ms: default_step_timeout_ms(),
            event_capacity: default_event_capacity(),
            default_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would stall the engine (zero caps, zero polling).
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_executions = self.max_concurrent_executions.max(1);
        self.max_parallel_steps = self.max_parallel_steps.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.default_retry.max_attempts = self.default_retry.max_attempts.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Backoff controller
// ---------------------------------------------------------------------------

/// Settings for a backoff controller guarding a periodic operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Attempts per `run` call before giving up.
    #[serde(default = "default_backoff_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts within one `run` call.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Consecutive failures that trigger a cool-off window.
    #[serde(default = "default_cool_off_threshold")]
    pub cool_off_threshold: u32,

    /// Length of the cool-off window.
    #[serde(default = "default_cool_off_duration_ms")]
    pub cool_off_duration_ms: u64,

    /// Probability in [0, 1] that a call on a healthy controller actually runs.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_backoff_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_cool_off_threshold() -> u32 {
    5
}

fn default_cool_off_duration_ms() -> u64 {
    60_000
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_backoff_attempts(),
            base_delay_ms: default_base_delay_ms(),
            cool_off_threshold: default_cool_off_threshold(),
            cool_off_duration_ms: default_cool_off_duration_ms(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl BackoffConfig {
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.cool_off_threshold = self.cool_off_threshold.max(1);
        self.sample_rate = if self.sample_rate.is_nan() {
            1.0
        } else {
            self.sample_rate.clamp(0.0, 1.0)
        };
        self
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Log output settings consumed by `stepflow-observe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive. Falls back to `RUST_LOG`, then `info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Also export spans to stdout through OpenTelemetry.
    #[serde(default)]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}
