use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::WorkflowStore;
use crate::workflows::types::{
    Condition, ParallelExecution, StepDefinition, WorkflowDefinition, WorkflowGraph,
};

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowDefinition>,
    steps: HashMap<Uuid, StepDefinition>,
    conditions: HashMap<Uuid, Condition>,
    next_sequence: i64,
    executions: Vec<ParallelExecution>,
    instance_graphs: HashMap<Uuid, WorkflowGraph>,
}

/// Process-local store, used for tests and for embedding the engine without
/// a database.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_executions(mut rows: Vec<ParallelExecution>) -> Vec<ParallelExecution> {
    rows.sort_by(|a, b| {
        a.parallel_group
            .cmp(&b.parallel_group)
            .then(a.execution_order.cmp(&b.execution_order))
    });
    rows
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        let mut state = self.state.write().await;
        if state.workflows.contains_key(&workflow.id) {
            return Err(Error::Conflict(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        state.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        Ok(self.state.read().await.workflows.get(&id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let state = self.state.read().await;
        let mut workflows: Vec<_> = state.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(workflows)
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| Error::NotFound(format!("workflow '{}'", workflow.id)))?;
        *slot = workflow.clone();
        Ok(())
    }

    async fn create_step(&self, step: StepDefinition) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.workflows.contains_key(&step.workflow_id) {
            return Err(Error::NotFound(format!("workflow '{}'", step.workflow_id)));
        }
        state.steps.insert(step.id, step);
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepDefinition>> {
        Ok(self.state.read().await.steps.get(&id).cloned())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<StepDefinition>> {
        let state = self.state.read().await;
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|step| step.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.step_order
                .cmp(&b.step_order)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(steps)
    }

    async fn update_step(&self, step: &StepDefinition) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| Error::NotFound(format!("workflow step '{}'", step.id)))?;
        *slot = step.clone();
        Ok(())
    }

    async fn insert_condition(&self, mut condition: Condition) -> Result<Condition> {
        let mut state = self.state.write().await;
        if !state.steps.contains_key(&condition.step_id) {
            return Err(Error::NotFound(format!(
                "workflow step '{}'",
                condition.step_id
            )));
        }
        state.next_sequence += 1;
        condition.sequence = state.next_sequence;
        state.conditions.insert(condition.id, condition.clone());
        Ok(condition)
    }

    async fn get_condition(&self, id: Uuid) -> Result<Option<Condition>> {
        Ok(self.state.read().await.conditions.get(&id).cloned())
    }

    async fn list_step_conditions(&self, step_id: Uuid) -> Result<Vec<Condition>> {
        let state = self.state.read().await;
        let mut conditions: Vec<_> = state
            .conditions
            .values()
            .filter(|condition| condition.step_id == step_id)
            .cloned()
            .collect();
        conditions.sort_by_key(|condition| condition.sequence);
        Ok(conditions)
    }

    async fn list_workflow_conditions(&self, workflow_id: Uuid) -> Result<Vec<Condition>> {
        let state = self.state.read().await;
        let mut conditions: Vec<_> = state
            .conditions
            .values()
            .filter(|condition| {
                state
                    .steps
                    .get(&condition.step_id)
                    .is_some_and(|step| step.workflow_id == workflow_id)
            })
            .cloned()
            .collect();
        conditions.sort_by_key(|condition| condition.sequence);
        Ok(conditions)
    }

    async fn update_condition(&self, condition: &Condition) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .conditions
            .get_mut(&condition.id)
            .ok_or_else(|| Error::NotFound(format!("workflow condition '{}'", condition.id)))?;
        *slot = condition.clone();
        Ok(())
    }

    async fn delete_condition(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.conditions.remove(&id).is_some())
    }

    async fn insert_executions(&self, executions: &[ParallelExecution]) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(duplicate) = executions
            .iter()
            .find(|row| state.executions.iter().any(|existing| existing.id == row.id))
        {
            return Err(Error::Conflict(format!(
                "parallel execution '{}' already exists",
                duplicate.id
            )));
        }
        state.executions.extend_from_slice(executions);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ParallelExecution>> {
        let state = self.state.read().await;
        Ok(state.executions.iter().find(|row| row.id == id).cloned())
    }

    async fn list_executions(&self, approval_request_id: Uuid) -> Result<Vec<ParallelExecution>> {
        let state = self.state.read().await;
        Ok(sorted_executions(
            state
                .executions
                .iter()
                .filter(|row| row.approval_request_id == approval_request_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_group_executions(
        &self,
        approval_request_id: Uuid,
        group: &str,
    ) -> Result<Vec<ParallelExecution>> {
        let state = self.state.read().await;
        Ok(sorted_executions(
            state
                .executions
                .iter()
                .filter(|row| {
                    row.approval_request_id == approval_request_id && row.parallel_group == group
                })
                .cloned()
                .collect(),
        ))
    }

    async fn update_execution(&self, execution: &ParallelExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .executions
            .iter_mut()
            .find(|row| row.id == execution.id)
            .ok_or_else(|| Error::NotFound(format!("parallel execution '{}'", execution.id)))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn save_instance_graph(
        &self,
        approval_request_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .instance_graphs
            .insert(approval_request_id, graph.clone());
        Ok(())
    }

    async fn get_instance_graph(
        &self,
        approval_request_id: Uuid,
    ) -> Result<Option<WorkflowGraph>> {
        Ok(self
            .state
            .read()
            .await
            .instance_graphs
            .get(&approval_request_id)
            .cloned())
    }

    async fn import_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &[StepDefinition],
        conditions: &[Condition],
    ) -> Result<Vec<Condition>> {
        let mut state = self.state.write().await;

        if state.workflows.contains_key(&workflow.id) {
            return Err(Error::Conflict(format!("workflow '{}' already exists", workflow.id)));
        }
        let mut step_ids = HashSet::new();
        for step in steps {
            if step.workflow_id != workflow.id {
                return Err(Error::Validation(format!(
                    "workflow step '{}' belongs to another workflow",
                    step.id
                )));
            }
            if state.steps.contains_key(&step.id) || !step_ids.insert(step.id) {
                return Err(Error::Conflict(format!("workflow step '{}' already exists", step.id)));
            }
        }
        let mut condition_ids = HashSet::new();
        for condition in conditions {
            if !step_ids.contains(&condition.step_id) {
                return Err(Error::NotFound(format!("workflow step '{}'", condition.step_id)));
            }
            if state.conditions.contains_key(&condition.id) || !condition_ids.insert(condition.id) {
                return Err(Error::Conflict(format!(
                    "workflow condition '{}' already exists",
                    condition.id
                )));
            }
        }

        state.workflows.insert(workflow.id, workflow.clone());
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        let mut stored = Vec::with_capacity(conditions.len());
        for condition in conditions {
            state.next_sequence += 1;
            let mut condition = condition.clone();
            condition.sequence = state.next_sequence;
            state.conditions.insert(condition.id, condition.clone());
            stored.push(condition);
        }
        Ok(stored)
    }

    async fn begin_instance(
        &self,
        approval_request_id: Uuid,
        executions: &[ParallelExecution],
        graph: Option<&WorkflowGraph>,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if state.instance_graphs.contains_key(&approval_request_id)
            || state
                .executions
                .iter()
                .any(|row| row.approval_request_id == approval_request_id)
        {
            return Err(Error::Conflict(format!(
                "instance '{approval_request_id}' has already started"
            )));
        }
        let mut row_ids = HashSet::new();
        for row in executions {
            if row.approval_request_id != approval_request_id {
                return Err(Error::Validation(format!(
                    "parallel execution '{}' belongs to another instance",
                    row.id
                )));
            }
            let stored = state.executions.iter().any(|existing| existing.id == row.id);
            if stored || !row_ids.insert(row.id) {
                return Err(Error::Conflict(format!(
                    "parallel execution '{}' already exists",
                    row.id
                )));
            }
        }

        state.executions.extend_from_slice(executions);
        if let Some(graph) = graph {
            state.instance_graphs.insert(approval_request_id, graph.clone());
        }
        Ok(())
    }
}
