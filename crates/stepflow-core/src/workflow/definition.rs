//! Workflow definition validation, YAML parsing, and filesystem operations.
//!
//! `validate_definition` enforces the structural rules every registered
//! definition must satisfy (required fields, unique step ids, resolvable
//! dependencies, acyclicity, well-formed parameters and policies).
//! `validate_executors` adds the checks that need the executor registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag::validate_dag;
use super::error::ValidationError;
use super::retry::RetryHandler;
use super::step::ExecutorRegistry;

/// Errors from loading or saving definition files.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid workflow: {0}")]
    Invalid(#[from] ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural validation, independent of which executors exist.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id".to_string()));
    }
    if def.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if def.version.trim().is_empty() {
        return Err(ValidationError::MissingField("version".to_string()));
    }
    semver::Version::parse(&def.version).map_err(|e| ValidationError::InvalidVersion {
        version: def.version.clone(),
        reason: e.to_string(),
    })?;
    if def.steps.is_empty() {
        return Err(ValidationError::MissingField("steps".to_string()));
    }
    if def.max_execution_time_ms == Some(0) {
        return Err(ValidationError::InvalidTimeout {
            scope: def.id.clone(),
        });
    }
    if let Some(policy) = &def.retry {
        RetryHandler::validate_policy(policy).map_err(|reason| {
            ValidationError::InvalidRetryPolicy {
                scope: def.id.clone(),
                reason,
            }
        })?;
    }

    let mut seen = HashSet::with_capacity(def.steps.len());
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(ValidationError::MissingField("steps[].id".to_string()));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
        if step.executor.trim().is_empty() {
            return Err(ValidationError::MissingField(format!(
                "steps[{}].executor",
                step.id
            )));
        }
        if step.timeout_ms == Some(0) {
            return Err(ValidationError::InvalidTimeout {
                scope: step.id.clone(),
            });
        }
        if let Some(policy) = &step.retry {
            RetryHandler::validate_policy(policy).map_err(|reason| {
                ValidationError::InvalidRetryPolicy {
                    scope: step.id.clone(),
                    reason,
                }
            })?;
        }
        for (key, value) in &step.parameters {
            if key.is_empty() {
                return Err(ValidationError::InvalidParameter {
                    step: step.id.clone(),
                    reason: "empty parameter name".to_string(),
                });
            }
            value
                .validate()
                .map_err(|e| ValidationError::InvalidParameter {
                    step: step.id.clone(),
                    reason: format!("'{key}': {e}"),
                })?;
        }
    }

    validate_dag(&def.steps)?;
    Ok(())
}

/// Every step must name a registered executor that accepts its parameters.
pub fn validate_executors(
    def: &WorkflowDefinition,
    registry: &ExecutorRegistry,
) -> Result<(), ValidationError> {
    for step in &def.steps {
        let Some(executor) = registry.get(&step.executor) else {
            return Err(ValidationError::UnknownExecutor {
                step: step.id.clone(),
                executor: step.executor.clone(),
            });
        };
        executor
            .validate_parameters(&step.parameters)
            .map_err(|reason| ValidationError::InvalidParameter {
                step: step.id.clone(),
                reason,
            })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// YAML
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a definition as YAML, creating parent directories as needed.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Recursively find `.yaml`/`.yml` definitions under `base_dir`, sorted by
/// path. Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use stepflow_types::value::ParamValue;
    use stepflow_types::workflow::{RetryPolicy, StepDefinition};

    use super::*;
    use crate::workflow::error::{CycleError, StepError};
    use crate::workflow::step::{BoxStepExecutor, StepExecutor, StepInput};

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "recon".to_string(),
            name: "Recon".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            steps,
            retry: None,
            max_execution_time_ms: None,
            metadata: HashMap::new(),
        }
    }

    fn abc() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new("a", "noop"),
            StepDefinition::new("b", "noop").depends_on(["a"]),
            StepDefinition::new("c", "noop").depends_on(["a"]),
        ]
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&workflow(abc())).is_ok());
    }

    #[test]
    fn test_missing_fields() {
        let mut def = workflow(abc());
        def.name = "  ".to_string();
        assert_eq!(
            validate_definition(&def).unwrap_err(),
            ValidationError::MissingField("name".to_string())
        );

        let empty = workflow(vec![]);
        assert_eq!(
            validate_definition(&empty).unwrap_err(),
            ValidationError::MissingField("steps".to_string())
        );

        let no_executor = workflow(vec![StepDefinition::new("a", "")]);
        let msg = validate_definition(&no_executor).unwrap_err().to_string();
        assert!(msg.contains("steps[a].executor"), "got: {msg}");
    }

    #[test]
    fn test_invalid_version() {
        let mut def = workflow(abc());
        def.version = "one".to_string();
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_duplicate_step_id() {
        let def = workflow(vec![
            StepDefinition::new("a", "noop"),
            StepDefinition::new("a", "noop"),
        ]);
        assert_eq!(
            validate_definition(&def).unwrap_err(),
            ValidationError::DuplicateStepId("a".to_string())
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let def = workflow(vec![StepDefinition::new("a", "noop").depends_on(["ghost"])]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("ghost"), "got: {msg}");
    }

    #[test]
    fn test_cycle_rejected() {
        let def = workflow(vec![
            StepDefinition::new("x", "noop").depends_on(["y"]),
            StepDefinition::new("y", "noop").depends_on(["x"]),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert!(
            matches!(&err, ValidationError::Cycle(CycleError { step_id }) if step_id == "x" || step_id == "y"),
            "got: {err:?}"
        );
    }

    #[test]
    fn test_invalid_parameter_value() {
        let def = workflow(vec![
            StepDefinition::new("a", "noop").with_parameter("ratio", f64::NAN),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { ref step, .. } if step == "a"));
    }

    #[test]
    fn test_invalid_retry_and_timeout() {
        let def = workflow(vec![StepDefinition::new("a", "noop").with_retry(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        })]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidRetryPolicy { .. })
        ));

        let def = workflow(vec![StepDefinition::new("a", "noop").with_timeout_ms(0)]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidTimeout { .. })
        ));

        let mut def = workflow(abc());
        def.max_execution_time_ms = Some(0);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidTimeout { .. })
        ));
    }

    struct RequiresTarget;

    impl StepExecutor for RequiresTarget {
        async fn execute(&self, _input: &StepInput) -> Result<ParamValue, StepError> {
            Ok(ParamValue::Null)
        }

        fn validate_parameters(
            &self,
            parameters: &stepflow_types::value::Parameters,
        ) -> Result<(), String> {
            if parameters.contains_key("target") {
                Ok(())
            } else {
                Err("'target' is required".to_string())
            }
        }
    }

    #[test]
    fn test_validate_executors() {
        let registry = ExecutorRegistry::new();
        registry.register("scan", BoxStepExecutor::new(RequiresTarget));

        let unknown = workflow(vec![StepDefinition::new("a", "missing")]);
        assert!(matches!(
            validate_executors(&unknown, &registry),
            Err(ValidationError::UnknownExecutor { .. })
        ));

        let bad_params = workflow(vec![StepDefinition::new("a", "scan")]);
        let msg = validate_executors(&bad_params, &registry)
            .unwrap_err()
            .to_string();
        assert!(msg.contains("'target' is required"), "got: {msg}");

        let ok = workflow(vec![
            StepDefinition::new("a", "scan").with_parameter("target", "example.org"),
        ]);
        assert!(validate_executors(&ok, &registry).is_ok());
    }

    #[test]
    fn test_parse_yaml_rejects_cycle() {
        let yaml = r#"
id: loop
name: Loop
version: "0.1.0"
steps:
  - id: x
    executor: noop
    depends_on: [y]
  - id: y
    executor: noop
    depends_on: [x]
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "got: {msg}");
    }

    #[test]
    fn test_parse_yaml_syntax_error() {
        let err = parse_workflow_yaml("id: [unterminated").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = workflow(abc());
        let nested = dir.path().join("nested").join("recon.yaml");
        save_workflow_file(&nested, &def).unwrap();

        let loaded = load_workflow_file(&nested).unwrap();
        assert_eq!(loaded, def);

        let mut other = workflow(vec![StepDefinition::new("only", "noop")]);
        other.id = "single".to_string();
        save_workflow_file(&dir.path().join("single.yml"), &other).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "not: [valid").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        let ids: Vec<&str> = found.iter().map(|(_, d)| d.id.as_str()).collect();
        assert_eq!(ids, vec!["recon", "single"]);
    }

    #[test]
    fn test_discover_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_workflows(&dir.path().join("absent")).unwrap();
        assert!(found.is_empty());
    }
}
