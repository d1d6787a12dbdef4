//! Workflow definition types.
//!
//! A `WorkflowDefinition` is an immutable template: an ordered list of steps
//! with dependency edges, optional retry policies, and optional time limits.
//! Definitions are authored in YAML or built programmatically and validated
//! once when registered with the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Parameters;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A reusable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Caller-chosen unique identifier (e.g. "recon-basic").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order. Declaration order fixes the execution order
    /// among steps that do not depend on each other.
    pub steps: Vec<StepDefinition>,
    /// Retry policy inherited by steps that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Hard ceiling on a single execution's wall-clock time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    /// Free-form metadata carried alongside the definition.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl WorkflowDefinition {
    /// Find a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Retry policy that applies to `step`: the step's own, then the
    /// definition's, then `fallback`.
    pub fn effective_retry<'a>(
        &'a self,
        step: &'a StepDefinition,
        fallback: &'a RetryPolicy,
    ) -> &'a RetryPolicy {
        step.retry
            .as_ref()
            .or(self.retry.as_ref())
            .unwrap_or(fallback)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work bound to a named step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, unique within its workflow.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the registered step executor that runs this step.
    pub executor: String,
    /// Parameters handed to the executor.
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    /// Step ids that must complete before this step may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Step-level retry policy (overrides the definition's).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    /// Build a step with no parameters, dependencies, or overrides.
    pub fn new(id: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            executor: executor.into(),
            parameters: Parameters::new(),
            depends_on: Vec::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::value::ParamValue>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry behaviour for a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How the delay grows between attempts.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Delay before the first retry.
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Growth factor. Exponential defaults to 2.0; linear defaults to the
    /// initial delay (one initial delay added per retry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            initial_delay_ms: 0,
            max_delay_ms: None,
            multiplier: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: delay_ms,
            ..Self::default()
        }
    }

    pub fn linear(max_attempts: u32, initial_delay_ms: u64, step_ms: f64) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Linear,
            initial_delay_ms,
            multiplier: Some(step_ms),
            ..Self::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms,
            multiplier: Some(multiplier),
            ..Self::default()
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }
}

/// Delay growth strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ParamValue;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "recon".to_string(),
            name: "Recon".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            steps: vec![
                StepDefinition::new("a", "dns").with_parameter("target", "example.org"),
                StepDefinition::new("b", "whois")
                    .depends_on(["a"])
                    .with_retry(RetryPolicy::fixed(3, 10)),
            ],
            retry: Some(RetryPolicy::exponential(2, 100, 2.0)),
            max_execution_time_ms: Some(60_000),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_effective_retry_prefers_step_then_definition() {
        let def = sample_definition();
        let fallback = RetryPolicy::default();
        let a = def.step("a").unwrap();
        let b = def.step("b").unwrap();
        assert_eq!(def.effective_retry(a, &fallback).max_attempts, 2);
        assert_eq!(def.effective_retry(b, &fallback).max_attempts, 3);

        let mut bare = def.clone();
        bare.retry = None;
        let a = bare.step("a").unwrap();
        assert_eq!(bare.effective_retry(a, &fallback), &fallback);
    }

    #[test]
    fn test_retry_policy_defaults_from_empty_yaml() {
        let policy: RetryPolicy = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
        assert_eq!(policy.initial_delay_ms, 0);
        assert!(policy.max_delay_ms.is_none());
    }

    #[test]
    fn test_definition_yaml_shape() {
        let yaml = r#"
id: recon
name: Recon
version: "1.0.0"
steps:
  - id: a
    executor: dns
    parameters:
      target: example.org
  - id: b
    executor: whois
    depends_on: [a]
    retry:
      max_attempts: 3
      strategy: exponential
      initial_delay_ms: 100
      multiplier: 2.0
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(
            def.steps[0].parameters.get("target"),
            Some(&ParamValue::from("example.org"))
        );
        let retry = def.steps[1].retry.as_ref().unwrap();
        assert_eq!(retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(retry.multiplier, Some(2.0));
        assert!(def.retry.is_none());
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let step = StepDefinition::new("a", "dns");
        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("parameters").is_none());
        assert!(json.get("depends_on").is_none());
        assert!(json.get("retry").is_none());
    }
}
