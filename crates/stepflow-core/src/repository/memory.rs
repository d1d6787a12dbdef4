//! In-memory `ExecutionStore`, the default for a single process lifetime.

use dashmap::DashMap;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::Execution;
use stepflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use super::execution::ExecutionStore;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    definitions: DashMap<String, WorkflowDefinition>,
    executions: DashMap<Uuid, Execution>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

impl ExecutionStore for InMemoryStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    async fn load_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> =
            self.definitions.iter().map(|d| d.value().clone()).collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }
}
