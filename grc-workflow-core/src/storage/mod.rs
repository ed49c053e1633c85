pub mod factory;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::workflows::types::{
    Condition, ParallelExecution, StepDefinition, WorkflowDefinition, WorkflowGraph,
};

pub use factory::create_workflow_store;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence for workflow definitions and per-instance execution state.
///
/// Listing methods return records in their routing order: steps by
/// `step_order`, conditions by `sequence`, executions by group then
/// `execution_order`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_workflow(&self, workflow: WorkflowDefinition) -> Result<()>;
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;
    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    async fn create_step(&self, step: StepDefinition) -> Result<()>;
    async fn get_step(&self, id: Uuid) -> Result<Option<StepDefinition>>;
    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<StepDefinition>>;
    async fn update_step(&self, step: &StepDefinition) -> Result<()>;

    /// Stores `condition` with the next insertion sequence and returns the
    /// stored record.
    async fn insert_condition(&self, condition: Condition) -> Result<Condition>;
    async fn get_condition(&self, id: Uuid) -> Result<Option<Condition>>;
    async fn list_step_conditions(&self, step_id: Uuid) -> Result<Vec<Condition>>;
    async fn list_workflow_conditions(&self, workflow_id: Uuid) -> Result<Vec<Condition>>;
    async fn update_condition(&self, condition: &Condition) -> Result<()>;
    async fn delete_condition(&self, id: Uuid) -> Result<bool>;

    /// Inserts all rows or none.
    async fn insert_executions(&self, executions: &[ParallelExecution]) -> Result<()>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<ParallelExecution>>;
    async fn list_executions(&self, approval_request_id: Uuid) -> Result<Vec<ParallelExecution>>;
    async fn list_group_executions(
        &self,
        approval_request_id: Uuid,
        group: &str,
    ) -> Result<Vec<ParallelExecution>>;
    async fn update_execution(&self, execution: &ParallelExecution) -> Result<()>;

    async fn save_instance_graph(
        &self,
        approval_request_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<()>;
    async fn get_instance_graph(
        &self,
        approval_request_id: Uuid,
    ) -> Result<Option<WorkflowGraph>>;

    /// Writes a new workflow with its steps and conditions in one unit.
    /// Conditions receive sequences in the order given. Nothing is stored
    /// when any record fails.
    async fn import_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &[StepDefinition],
        conditions: &[Condition],
    ) -> Result<Vec<Condition>>;

    /// Records an instance start: its execution rows and, when given, the
    /// pinned graph. Fails with `Conflict` if the instance already has either,
    /// and writes nothing on any failure.
    async fn begin_instance(
        &self,
        approval_request_id: Uuid,
        executions: &[ParallelExecution],
        graph: Option<&WorkflowGraph>,
    ) -> Result<()>;
}

pub async fn require_workflow(
    store: &dyn WorkflowStore,
    id: Uuid,
) -> Result<WorkflowDefinition> {
    store
        .get_workflow(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workflow '{id}'")))
}

pub async fn require_step(store: &dyn WorkflowStore, id: Uuid) -> Result<StepDefinition> {
    store
        .get_step(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workflow step '{id}'")))
}

/// Loads the live step/condition graph of a workflow.
pub async fn load_workflow_graph(
    store: &dyn WorkflowStore,
    workflow_id: Uuid,
) -> Result<WorkflowGraph> {
    let workflow = require_workflow(store, workflow_id).await?;
    let steps = store.list_steps(workflow_id).await?;
    let conditions = store.list_workflow_conditions(workflow_id).await?;
    Ok(WorkflowGraph::new(workflow, steps, conditions))
}
