//! Step executor capability and the executor registry.
//!
//! A step names its executor by string; the surrounding application registers
//! implementations under those names. Follows the blanket-impl pattern used
//! for object-safe async traits:
//! 1. `StepExecutor` uses native async fn in traits (RPITIT)
//! 2. Object-safe `StepExecutorDyn` with boxed futures, blanket-impl'd for all `T: StepExecutor`
//! 3. `BoxStepExecutor` wraps `Arc<dyn StepExecutorDyn>` and delegates

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use stepflow_types::value::{ParamValue, Parameters};
use uuid::Uuid;

use super::error::StepError;

/// Everything an executor sees for one attempt.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The step's declared parameters.
    pub parameters: Parameters,
    /// Input bindings the execution was started with.
    pub inputs: Parameters,
    /// Results of the step's direct dependencies, keyed by step id.
    pub dependency_results: BTreeMap<String, ParamValue>,
}

impl StepInput {
    /// Parameter lookup falling back to the execution inputs.
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key).or_else(|| self.inputs.get(key))
    }
}

/// A unit of work a step can be bound to.
pub trait StepExecutor: Send + Sync {
    /// Run one attempt. Errors are retried according to the step's policy.
    fn execute(
        &self,
        input: &StepInput,
    ) -> impl Future<Output = Result<ParamValue, StepError>> + Send;

    /// Check a step's parameters once, at workflow registration.
    fn validate_parameters(&self, _parameters: &Parameters) -> Result<(), String> {
        Ok(())
    }
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<ParamValue, StepError>> + Send + 'a>>;

    fn validate_parameters_dyn(&self, parameters: &Parameters) -> Result<(), String>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        input: &'a StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<ParamValue, StepError>> + Send + 'a>> {
        Box::pin(self.execute(input))
    }

    fn validate_parameters_dyn(&self, parameters: &Parameters) -> Result<(), String> {
        self.validate_parameters(parameters)
    }
}

/// Type-erased, cheaply clonable step executor.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn execute(&self, input: &StepInput) -> Result<ParamValue, StepError> {
        self.inner.execute_boxed(input).await
    }

    pub fn validate_parameters(&self, parameters: &Parameters) -> Result<(), String> {
        self.inner.validate_parameters_dyn(parameters)
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a [`StepExecutor`].
pub struct FnStepExecutor<F> {
    f: F,
}

/// Build an executor from `Fn(StepInput) -> impl Future<Output = Result<ParamValue, StepError>>`.
pub fn from_fn<F, Fut>(f: F) -> FnStepExecutor<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ParamValue, StepError>> + Send,
{
    FnStepExecutor { f }
}

impl<F, Fut> StepExecutor for FnStepExecutor<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ParamValue, StepError>> + Send,
{
    fn execute(
        &self,
        input: &StepInput,
    ) -> impl Future<Output = Result<ParamValue, StepError>> + Send {
        (self.f)(input.clone())
    }
}

/// Name-to-executor lookup shared by the engine and its callers.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, BoxStepExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under `name`, returning the one it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        executor: BoxStepExecutor,
    ) -> Option<BoxStepExecutor> {
        self.executors.insert(name.into(), executor)
    }

    pub fn get(&self, name: &str) -> Option<BoxStepExecutor> {
        self.executors.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl StepExecutor for Echo {
        async fn execute(&self, input: &StepInput) -> Result<ParamValue, StepError> {
            input
                .param("message")
                .cloned()
                .ok_or_else(|| StepError::InvalidParameters("missing 'message'".to_string()))
        }

        fn validate_parameters(&self, parameters: &Parameters) -> Result<(), String> {
            match parameters.get("message") {
                Some(ParamValue::String(_)) | None => Ok(()),
                Some(other) => Err(format!("'message' must be a string, got {}", other.kind())),
            }
        }
    }

    fn input(parameters: Parameters) -> StepInput {
        StepInput {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            step_id: "a".to_string(),
            attempt: 1,
            parameters,
            inputs: Parameters::new(),
            dependency_results: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_box_executor_delegates() {
        let exec = BoxStepExecutor::new(Echo);
        let mut params = Parameters::new();
        params.insert("message".to_string(), ParamValue::from("hi"));
        let out = exec.execute(&input(params)).await.unwrap();
        assert_eq!(out, ParamValue::from("hi"));

        let err = exec.execute(&input(Parameters::new())).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidParameters(_)));
    }

    #[test]
    fn test_box_executor_validate_parameters() {
        let exec = BoxStepExecutor::new(Echo);
        let mut params = Parameters::new();
        params.insert("message".to_string(), ParamValue::Int(3));
        let err = exec.validate_parameters(&params).unwrap_err();
        assert!(err.contains("int"), "got: {err}");
    }

    #[tokio::test]
    async fn test_param_falls_back_to_inputs() {
        let exec = BoxStepExecutor::new(Echo);
        let mut step_input = input(Parameters::new());
        step_input
            .inputs
            .insert("message".to_string(), ParamValue::from("from input"));
        let out = exec.execute(&step_input).await.unwrap();
        assert_eq!(out, ParamValue::from("from input"));
    }

    #[tokio::test]
    async fn test_from_fn_executor() {
        let exec = BoxStepExecutor::new(from_fn(|input: StepInput| async move {
            Ok(ParamValue::Int(i64::from(input.attempt)))
        }));
        let out = exec.execute(&input(Parameters::new())).await.unwrap();
        assert_eq!(out, ParamValue::Int(1));
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = ExecutorRegistry::new();
        assert!(registry.register("echo", BoxStepExecutor::new(Echo)).is_none());
        assert!(registry.register("echo", BoxStepExecutor::new(Echo)).is_some());
        registry.register("alpha", BoxStepExecutor::new(Echo));

        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["alpha", "echo"]);
    }
}
