use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::conditions::ConditionEvaluator;
use super::loader::{BundleLoader, WorkflowBundle};
use super::parallel::{
    apply_update, group_status, plan_parallel_groups, GroupStatus, TransitionOutcome,
};
use super::router::{RoutingDecision, SequentialRouter};
use super::types::{
    Condition, ConditionPatch, ExecutionStatus, ExecutionUpdate, NewCondition, NewStep,
    NewWorkflow, ParallelExecution, StepDefinition, StepPatch, WorkflowDefinition, WorkflowGraph,
    WorkflowPatch,
};
use super::validation::{graph_issues, validate_rule, validate_step_shape, GraphIssue};
use crate::config::schema::EngineConfig;
use crate::error::{Error, Result};
use crate::events::types::Event;
use crate::events::EventBus;
use crate::storage::{load_workflow_graph, require_step, require_workflow, WorkflowStore};

/// What `start_instance` created.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStart {
    pub approval_request_id: Uuid,
    pub workflow_id: Uuid,
    /// First step that is routed sequentially, if any.
    pub first_step_id: Option<Uuid>,
    pub executions: Vec<ParallelExecution>,
    pub snapshot_taken: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub status: GroupStatus,
    pub total: usize,
    pub completed: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub approval_request_id: Uuid,
    pub workflow: WorkflowDefinition,
    /// Whether routing for this instance uses a graph frozen at start.
    pub pinned: bool,
    pub steps: Vec<StepDefinition>,
    pub conditions: Vec<Condition>,
    pub executions: Vec<ParallelExecution>,
    pub groups: Vec<GroupSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportedWorkflow {
    pub workflow: WorkflowDefinition,
    pub steps: Vec<StepDefinition>,
    pub conditions: Vec<Condition>,
}

enum GraphChange {
    Workflow(WorkflowDefinition),
    Step(StepDefinition),
    Condition(Condition),
}

/// Entry point for callers: definition management with write-time
/// validation, routing, and parallel branch tracking over a
/// [`WorkflowStore`].
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    config: EngineConfig,
    evaluator: ConditionEvaluator,
    router: SequentialRouter,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        Self::with_event_bus(store, config, EventBus::default())
    }

    pub fn with_event_bus(
        store: Arc<dyn WorkflowStore>,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        let evaluator = ConditionEvaluator::new(config.evaluator_options());
        Self {
            store,
            config,
            evaluator,
            router: SequentialRouter::new(evaluator),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn apply_change(graph: &WorkflowGraph, change: GraphChange) -> WorkflowGraph {
        fn upsert<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> Uuid) {
            match items.iter().position(|existing| id(existing) == id(&item)) {
                Some(index) => items[index] = item,
                None => items.push(item),
            }
        }

        let mut workflow = graph.workflow.clone();
        let mut steps = graph.steps.clone();
        let mut conditions: Vec<Condition> = graph.conditions.values().flatten().cloned().collect();
        match change {
            GraphChange::Workflow(updated) => workflow = updated,
            GraphChange::Step(step) => upsert(&mut steps, step, |step| step.id),
            GraphChange::Condition(condition) => {
                upsert(&mut conditions, condition, |condition| condition.id)
            }
        }
        WorkflowGraph::new(workflow, steps, conditions)
    }

    /// Rejects a write that would add a configuration problem. Problems the
    /// stored graph already has do not block unrelated edits.
    fn ensure_no_new_issues(&self, before: &WorkflowGraph, after: &WorkflowGraph) -> Result<()> {
        let allow_cycles = self.config.allow_cyclic_routes;
        let existing = graph_issues(before, allow_cycles);
        let had_cycle = existing
            .iter()
            .any(|issue| matches!(issue, GraphIssue::Cycle { .. }));

        let introduced = graph_issues(after, allow_cycles)
            .into_iter()
            .find(|issue| match issue {
                GraphIssue::Cycle { .. } => !had_cycle,
                other => !existing.contains(other),
            });

        match introduced {
            Some(issue) => Err(Error::Validation(format!(
                "workflow '{}': {issue}",
                after.workflow.name
            ))),
            None => Ok(()),
        }
    }

    fn definition_changed(&self, workflow_id: Uuid) {
        self.events.publish(Event::DefinitionChanged { workflow_id });
    }

    pub async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowDefinition> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("workflow name cannot be empty".to_owned()));
        }
        if new.entity_type.trim().is_empty() {
            return Err(Error::Validation(
                "workflow entity_type cannot be empty".to_owned(),
            ));
        }
        if new.convergence_step_id.is_some() {
            return Err(Error::Validation(
                "convergence_step_id can only be set once the step exists".to_owned(),
            ));
        }

        let now = Utc::now();
        let workflow = WorkflowDefinition {
            id: Uuid::new_v4(),
            name: new.name.trim().to_owned(),
            entity_type: new.entity_type.trim().to_owned(),
            is_active: true,
            execution_type: new.execution_type,
            convergence_step_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_workflow(workflow.clone()).await?;
        tracing::debug!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        self.definition_changed(workflow.id);
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition> {
        require_workflow(self.store.as_ref(), workflow_id).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.store.list_workflows().await
    }

    pub async fn update_workflow(
        &self,
        workflow_id: Uuid,
        patch: WorkflowPatch,
    ) -> Result<WorkflowDefinition> {
        let graph = load_workflow_graph(self.store.as_ref(), workflow_id).await?;
        let mut workflow = graph.workflow.clone();
        patch.apply(&mut workflow);
        if workflow.name.trim().is_empty() {
            return Err(Error::Validation("workflow name cannot be empty".to_owned()));
        }
        workflow.updated_at = Utc::now();

        let candidate = Self::apply_change(&graph, GraphChange::Workflow(workflow.clone()));
        self.ensure_no_new_issues(&graph, &candidate)?;

        self.store.update_workflow(&workflow).await?;
        self.definition_changed(workflow_id);
        Ok(workflow)
    }

    /// Workflows are never deleted; deactivation stops new instances.
    pub async fn deactivate_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition> {
        self.update_workflow(
            workflow_id,
            WorkflowPatch {
                is_active: Some(false),
                ..WorkflowPatch::default()
            },
        )
        .await
    }

    pub async fn create_step(&self, new: NewStep) -> Result<StepDefinition> {
        let graph = load_workflow_graph(self.store.as_ref(), new.workflow_id).await?;
        let step = StepDefinition {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            step_order: new.step_order,
            name: new.name.trim().to_owned(),
            assignee_role: new.assignee_role,
            required: new.required,
            is_parallel: new.is_parallel,
            parallel_group: new.parallel_group,
            parallel_order: new.parallel_order,
            created_at: Utc::now(),
        };
        validate_step_shape(&step)?;

        let candidate = Self::apply_change(&graph, GraphChange::Step(step.clone()));
        self.ensure_no_new_issues(&graph, &candidate)?;

        self.store.create_step(step.clone()).await?;
        tracing::debug!(
            step_id = %step.id,
            workflow_id = %step.workflow_id,
            "workflow step created"
        );
        self.definition_changed(step.workflow_id);
        Ok(step)
    }

    /// Steps of a workflow ordered by `step_order`.
    pub async fn get_conditional_steps(&self, workflow_id: Uuid) -> Result<Vec<StepDefinition>> {
        require_workflow(self.store.as_ref(), workflow_id).await?;
        self.store.list_steps(workflow_id).await
    }

    pub async fn update_conditional_step(
        &self,
        step_id: Uuid,
        patch: StepPatch,
    ) -> Result<StepDefinition> {
        let mut step = require_step(self.store.as_ref(), step_id).await?;
        let graph = load_workflow_graph(self.store.as_ref(), step.workflow_id).await?;
        patch.apply(&mut step);
        validate_step_shape(&step)?;

        let candidate = Self::apply_change(&graph, GraphChange::Step(step.clone()));
        self.ensure_no_new_issues(&graph, &candidate)?;

        self.store.update_step(&step).await?;
        self.definition_changed(step.workflow_id);
        Ok(step)
    }

    /// Conditions of every step in a workflow, in evaluation order.
    pub async fn get_workflow_conditions(&self, workflow_id: Uuid) -> Result<Vec<Condition>> {
        require_workflow(self.store.as_ref(), workflow_id).await?;
        self.store.list_workflow_conditions(workflow_id).await
    }

    pub async fn get_step_conditions(&self, step_id: Uuid) -> Result<Vec<Condition>> {
        self.store.list_step_conditions(step_id).await
    }

    pub async fn get_condition(&self, condition_id: Uuid) -> Result<Condition> {
        self.store
            .get_condition(condition_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow condition '{condition_id}'")))
    }

    pub async fn create_workflow_condition(&self, new: NewCondition) -> Result<Condition> {
        let step = require_step(self.store.as_ref(), new.step_id).await?;
        validate_rule(&new.rule, self.config.expression_options())?;
        if new.name.trim().is_empty() {
            return Err(Error::Validation("condition name cannot be empty".to_owned()));
        }

        let graph = load_workflow_graph(self.store.as_ref(), step.workflow_id).await?;
        let condition = Condition {
            id: Uuid::new_v4(),
            step_id: step.id,
            name: new.name.trim().to_owned(),
            rule: new.rule,
            next_step_id: new.next_step_id,
            is_active: true,
            sequence: i64::MAX,
            created_at: Utc::now(),
        };
        let candidate = Self::apply_change(&graph, GraphChange::Condition(condition.clone()));
        self.ensure_no_new_issues(&graph, &candidate)?;

        let stored = self.store.insert_condition(condition).await?;
        tracing::debug!(
            condition_id = %stored.id,
            step_id = %stored.step_id,
            condition_type = stored.rule.kind_name(),
            "workflow condition created"
        );
        self.definition_changed(step.workflow_id);
        Ok(stored)
    }

    pub async fn update_workflow_condition(
        &self,
        condition_id: Uuid,
        patch: ConditionPatch,
    ) -> Result<Condition> {
        let mut condition = self.get_condition(condition_id).await?;
        let step = require_step(self.store.as_ref(), condition.step_id).await?;
        let graph = load_workflow_graph(self.store.as_ref(), step.workflow_id).await?;

        patch.apply(&mut condition);
        validate_rule(&condition.rule, self.config.expression_options())?;
        let candidate = Self::apply_change(&graph, GraphChange::Condition(condition.clone()));
        self.ensure_no_new_issues(&graph, &candidate)?;

        self.store.update_condition(&condition).await?;
        self.definition_changed(step.workflow_id);
        Ok(condition)
    }

    pub async fn delete_workflow_condition(&self, condition_id: Uuid) -> Result<()> {
        let condition = self.get_condition(condition_id).await?;
        if !self.store.delete_condition(condition_id).await? {
            return Err(Error::NotFound(format!("workflow condition '{condition_id}'")));
        }
        if let Some(step) = self.store.get_step(condition.step_id).await? {
            self.definition_changed(step.workflow_id);
        }
        Ok(())
    }

    /// Every configuration problem in the stored workflow.
    pub async fn validate_workflow(&self, workflow_id: Uuid) -> Result<Vec<GraphIssue>> {
        let graph = load_workflow_graph(self.store.as_ref(), workflow_id).await?;
        Ok(graph_issues(&graph, self.config.allow_cyclic_routes))
    }

    pub fn evaluate_condition(&self, condition: &Condition, snapshot: &Value) -> bool {
        self.evaluator.evaluate(condition, snapshot)
    }

    /// Next step after `current_step_id` on the live definition. `None`
    /// means the workflow is complete.
    pub async fn get_next_step(
        &self,
        workflow_id: Uuid,
        current_step_id: Uuid,
        snapshot: &Value,
    ) -> Result<Option<Uuid>> {
        let graph = load_workflow_graph(self.store.as_ref(), workflow_id).await?;
        Ok(self.router.next_step(&graph, current_step_id, snapshot))
    }

    /// Steps an instance would visit from `start_step_id` if every step were
    /// decided against the same snapshot.
    pub async fn preview_route(
        &self,
        workflow_id: Uuid,
        start_step_id: Uuid,
        snapshot: &Value,
    ) -> Result<Vec<Uuid>> {
        let graph = load_workflow_graph(self.store.as_ref(), workflow_id).await?;
        if graph.step(start_step_id).is_none() {
            return Err(Error::NotFound(format!(
                "step '{start_step_id}' in workflow '{workflow_id}'"
            )));
        }
        self.router
            .walk(&graph, start_step_id, snapshot, self.config.max_route_steps)
    }

    /// The graph an instance routes on: its start-time copy if one exists,
    /// otherwise the live definition.
    async fn instance_graph(
        &self,
        instance_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<(WorkflowGraph, bool)> {
        match self.store.get_instance_graph(instance_id).await? {
            Some(graph) if graph.workflow.id == workflow_id => Ok((graph, true)),
            Some(graph) => Err(Error::InvalidState(format!(
                "instance '{instance_id}' runs workflow '{}', not '{workflow_id}'",
                graph.workflow.id
            ))),
            None => Ok((load_workflow_graph(self.store.as_ref(), workflow_id).await?, false)),
        }
    }

    async fn ensure_no_executions(&self, instance_id: Uuid) -> Result<()> {
        if !self.store.list_executions(instance_id).await?.is_empty() {
            return Err(Error::Conflict(format!(
                "instance '{instance_id}' already has parallel executions"
            )));
        }
        Ok(())
    }

    /// Checks the workflow can run parallel groups and builds one pending row
    /// per parallel step. Nothing is written.
    fn plan_executions(
        &self,
        instance_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<Vec<ParallelExecution>> {
        let workflow = &graph.workflow;
        if !workflow.execution_type.uses_parallel_groups() {
            return Err(Error::InvalidState(format!(
                "workflow '{}' is {} and has no parallel groups",
                workflow.id,
                workflow.execution_type.as_str()
            )));
        }
        if !workflow.is_active {
            return Err(Error::InvalidState(format!(
                "workflow '{}' is inactive",
                workflow.id
            )));
        }

        let plan = plan_parallel_groups(&graph.steps);
        let rows = plan.materialize(instance_id);
        tracing::debug!(
            approval_request_id = %instance_id,
            workflow_id = %workflow.id,
            groups = plan.groups.len(),
            branches = rows.len(),
            skipped = plan.skipped.len(),
            "parallel executions planned"
        );
        Ok(rows)
    }

    /// Creates one pending execution per parallel step. Fails without side
    /// effects for sequential workflows and for instances that already have
    /// executions.
    pub async fn start_parallel_execution(
        &self,
        instance_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Vec<ParallelExecution>> {
        let (graph, _) = self.instance_graph(instance_id, workflow_id).await?;
        let rows = self.plan_executions(instance_id, &graph)?;
        self.ensure_no_executions(instance_id).await?;
        self.store.insert_executions(&rows).await?;

        tracing::info!(
            approval_request_id = %instance_id,
            workflow_id = %workflow_id,
            branches = rows.len(),
            "parallel executions created"
        );
        Ok(rows)
    }

    pub async fn start_instance(
        &self,
        instance_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<InstanceStart> {
        let graph = load_workflow_graph(self.store.as_ref(), workflow_id).await?;
        if !graph.workflow.is_active {
            return Err(Error::InvalidState(format!(
                "workflow '{workflow_id}' is inactive and cannot start instances"
            )));
        }

        let executions = if graph.workflow.execution_type.uses_parallel_groups() {
            self.plan_executions(instance_id, &graph)?
        } else {
            Vec::new()
        };

        let snapshot_taken = self.config.snapshot_on_start;
        self.store
            .begin_instance(instance_id, &executions, snapshot_taken.then_some(&graph))
            .await?;

        let first_step_id = graph.first_step().map(|step| step.id);

        tracing::info!(
            approval_request_id = %instance_id,
            workflow_id = %workflow_id,
            execution_type = graph.workflow.execution_type.as_str(),
            executions = executions.len(),
            "workflow instance started"
        );
        self.events.publish(Event::InstanceStarted {
            approval_request_id: instance_id,
            workflow_id,
            first_step_id,
            executions_created: executions.len(),
        });

        Ok(InstanceStart {
            approval_request_id: instance_id,
            workflow_id,
            first_step_id,
            executions,
            snapshot_taken,
        })
    }

    /// Routes an instance past `current_step_id`. Hybrid convergence is left
    /// to the caller, who combines this with the group queries.
    pub async fn advance(
        &self,
        instance_id: Uuid,
        workflow_id: Uuid,
        current_step_id: Uuid,
        snapshot: &Value,
    ) -> Result<RoutingDecision> {
        let (graph, pinned) = self.instance_graph(instance_id, workflow_id).await?;
        if graph.step(current_step_id).is_none() {
            tracing::warn!(
                approval_request_id = %instance_id,
                step_id = %current_step_id,
                "current step is not part of the workflow"
            );
        }

        let decision = self.router.route(&graph, current_step_id, snapshot);
        tracing::debug!(
            approval_request_id = %instance_id,
            step_id = %current_step_id,
            pinned,
            ?decision,
            "instance advanced"
        );
        self.events.publish(Event::StepRouted {
            approval_request_id: instance_id,
            from_step_id: current_step_id,
            decision,
        });
        Ok(decision)
    }

    pub async fn get_parallel_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ParallelExecution>> {
        self.store.list_executions(instance_id).await
    }

    pub async fn get_parallel_group_executions(
        &self,
        instance_id: Uuid,
        group: &str,
    ) -> Result<Vec<ParallelExecution>> {
        self.store.list_group_executions(instance_id, group).await
    }

    pub async fn update_parallel_execution(
        &self,
        execution_id: Uuid,
        update: ExecutionUpdate,
    ) -> Result<ParallelExecution> {
        let current = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("parallel execution '{execution_id}'")))?;

        let updated = match apply_update(&current, &update, self.config.enforce_transitions)? {
            TransitionOutcome::Unchanged(row) => return Ok(row),
            TransitionOutcome::Changed(row) => row,
        };

        let policy = self.config.rejection_policy;
        let instance_id = current.approval_request_id;
        let group = current.parallel_group.clone();
        let before = group_status(
            &self.store.list_group_executions(instance_id, &group).await?,
            policy,
        );

        self.store.update_execution(&updated).await?;
        self.events.publish(Event::ExecutionUpdated {
            execution_id,
            approval_request_id: instance_id,
            parallel_group: group.clone(),
            from: current.status,
            to: updated.status,
        });

        let after = group_status(
            &self.store.list_group_executions(instance_id, &group).await?,
            policy,
        );
        if before == GroupStatus::Pending && after != GroupStatus::Pending {
            tracing::info!(
                approval_request_id = %instance_id,
                parallel_group = %group,
                status = ?after,
                "parallel group resolved"
            );
            self.events.publish(Event::GroupResolved {
                approval_request_id: instance_id,
                parallel_group: group,
                status: after,
            });
        }

        Ok(updated)
    }

    pub async fn parallel_group_status(
        &self,
        instance_id: Uuid,
        group: &str,
    ) -> Result<GroupStatus> {
        let rows = self.store.list_group_executions(instance_id, group).await?;
        Ok(group_status(&rows, self.config.rejection_policy))
    }

    /// Whether every branch of the group is done. Under the default policy a
    /// rejected branch keeps the group incomplete.
    pub async fn check_parallel_group_completion(
        &self,
        instance_id: Uuid,
        group: &str,
    ) -> Result<bool> {
        Ok(self.parallel_group_status(instance_id, group).await? == GroupStatus::Complete)
    }

    pub async fn instance_status(
        &self,
        instance_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<InstanceStatus> {
        let workflow = require_workflow(self.store.as_ref(), workflow_id).await?;
        let pinned = self.store.get_instance_graph(instance_id).await?.is_some();
        let steps = self.store.list_steps(workflow_id).await?;
        let conditions = self.store.list_workflow_conditions(workflow_id).await?;
        let executions = self.store.list_executions(instance_id).await?;

        let mut grouped: Vec<(String, Vec<ParallelExecution>)> = Vec::new();
        for row in &executions {
            match grouped.iter_mut().find(|(name, _)| *name == row.parallel_group) {
                Some((_, rows)) => rows.push(row.clone()),
                None => grouped.push((row.parallel_group.clone(), vec![row.clone()])),
            }
        }
        let groups = grouped
            .into_iter()
            .map(|(name, rows)| GroupSummary {
                status: group_status(&rows, self.config.rejection_policy),
                total: rows.len(),
                completed: rows
                    .iter()
                    .filter(|row| row.status == ExecutionStatus::Completed)
                    .count(),
                rejected: rows
                    .iter()
                    .filter(|row| row.status == ExecutionStatus::Rejected)
                    .count(),
                name,
            })
            .collect();

        Ok(InstanceStatus {
            approval_request_id: instance_id,
            workflow,
            pinned,
            steps,
            conditions,
            executions,
            groups,
        })
    }

    /// Creates a workflow with its steps and conditions from a bundle. The
    /// whole bundle is checked before anything is written.
    pub async fn import_bundle(&self, bundle: &WorkflowBundle) -> Result<ImportedWorkflow> {
        BundleLoader::validate(bundle)?;

        let now = Utc::now();
        let mut workflow = WorkflowDefinition {
            id: Uuid::new_v4(),
            name: bundle.workflow.name.trim().to_owned(),
            entity_type: bundle.workflow.entity_type.trim().to_owned(),
            is_active: bundle.workflow.is_active,
            execution_type: bundle.workflow.execution_type,
            convergence_step_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut ids: HashMap<String, Uuid> = HashMap::new();
        let mut steps = Vec::with_capacity(bundle.steps.len());
        for (position, entry) in bundle.steps.iter().enumerate() {
            let step = StepDefinition {
                id: Uuid::new_v4(),
                workflow_id: workflow.id,
                step_order: entry.effective_order(position),
                name: entry.name.trim().to_owned(),
                assignee_role: entry.assignee_role.clone(),
                required: entry.required,
                is_parallel: entry.effective_parallel(),
                parallel_group: entry.parallel_group.clone(),
                parallel_order: entry.parallel_order,
                created_at: now,
            };
            validate_step_shape(&step)?;
            ids.insert(step.name.clone(), step.id);
            steps.push(step);
        }

        let step_id = |name: &str| -> Result<Uuid> {
            ids.get(name.trim())
                .copied()
                .ok_or_else(|| Error::Validation(format!("unknown step '{name}'")))
        };
        workflow.convergence_step_id = bundle
            .workflow
            .convergence_step
            .as_deref()
            .map(step_id)
            .transpose()?;

        let expression_options = self.config.expression_options();
        let mut conditions = Vec::new();
        for (entry, step) in bundle.steps.iter().zip(&steps) {
            for rule_entry in &entry.conditions {
                validate_rule(&rule_entry.rule, expression_options)?;
                conditions.push(Condition {
                    id: Uuid::new_v4(),
                    step_id: step.id,
                    name: rule_entry.name.trim().to_owned(),
                    rule: rule_entry.rule.clone(),
                    next_step_id: rule_entry.next_step.as_deref().map(step_id).transpose()?,
                    is_active: rule_entry.is_active,
                    sequence: conditions.len() as i64,
                    created_at: now,
                });
            }
        }

        let graph = WorkflowGraph::new(workflow.clone(), steps, conditions.clone());
        if let Some(issue) = graph_issues(&graph, self.config.allow_cyclic_routes)
            .into_iter()
            .next()
        {
            return Err(Error::Validation(format!(
                "workflow '{}': {issue}",
                workflow.name
            )));
        }

        let stored = self
            .store
            .import_workflow(&workflow, &graph.steps, &conditions)
            .await?;

        tracing::info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = graph.steps.len(),
            conditions = stored.len(),
            "workflow bundle imported"
        );
        self.definition_changed(workflow.id);

        Ok(ImportedWorkflow {
            workflow,
            steps: graph.steps,
            conditions: stored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SqliteStore};
    use crate::workflows::parallel::RejectionPolicy;
    use crate::workflows::types::{CompareOperator, ConditionRule, ExecutionType};
    use serde_json::json;
    use std::path::Path;

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    async fn workflow(
        engine: &WorkflowEngine,
        execution_type: ExecutionType,
    ) -> WorkflowDefinition {
        engine
            .create_workflow(NewWorkflow {
                name: "Policy exception".to_owned(),
                entity_type: "policy".to_owned(),
                execution_type,
                convergence_step_id: None,
            })
            .await
            .expect("workflow")
    }

    async fn sequential_steps(
        engine: &WorkflowEngine,
        workflow_id: Uuid,
        count: i32,
    ) -> Vec<StepDefinition> {
        let mut steps = Vec::new();
        for order in 1..=count {
            let step = engine
                .create_step(NewStep::sequential(
                    workflow_id,
                    order,
                    &format!("S{order}"),
                    "approver",
                ))
                .await
                .expect("step");
            steps.push(step);
        }
        steps
    }

    fn custom(matches: bool) -> ConditionRule {
        ConditionRule::Custom {
            expression: matches.to_string(),
        }
    }

    async fn condition(
        engine: &WorkflowEngine,
        step_id: Uuid,
        name: &str,
        rule: ConditionRule,
        next_step_id: Option<Uuid>,
    ) -> Condition {
        engine
            .create_workflow_condition(NewCondition {
                step_id,
                name: name.to_owned(),
                rule,
                next_step_id,
            })
            .await
            .expect("condition")
    }

    #[tokio::test]
    async fn first_true_condition_in_creation_order_wins() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 4).await;
        condition(&engine, s[0].id, "A", custom(false), Some(s[1].id)).await;
        condition(&engine, s[0].id, "B", custom(true), Some(s[2].id)).await;
        condition(&engine, s[0].id, "C", custom(true), Some(s[3].id)).await;

        let next = engine.get_next_step(wf.id, s[0].id, &json!({})).await.expect("route");
        assert_eq!(next, Some(s[2].id));
    }

    #[tokio::test]
    async fn sequential_workflow_walks_in_step_order() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 3).await;

        for snapshot in [json!({}), json!({ "risk_level": "critical", "amount": 99 })] {
            let mut visited = vec![s[0].id];
            let mut current = s[0].id;
            while let Some(next) = engine
                .get_next_step(wf.id, current, &snapshot)
                .await
                .expect("route")
            {
                visited.push(next);
                current = next;
            }
            assert_eq!(visited, s.iter().map(|step| step.id).collect::<Vec<_>>());
        }

        let preview = engine.preview_route(wf.id, s[0].id, &json!({})).await.expect("preview");
        assert_eq!(preview.len(), 3);
    }

    #[tokio::test]
    async fn amount_threshold_routes_large_requests() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 5).await;
        let rule = ConditionRule::AmountThreshold {
            operator: CompareOperator::GreaterThan,
            value: "10000".to_owned(),
        };
        condition(&engine, s[0].id, "Large amount", rule, Some(s[4].id)).await;

        let large = engine
            .get_next_step(wf.id, s[0].id, &json!({ "amount": "15000" }))
            .await
            .expect("route");
        let small = engine
            .get_next_step(wf.id, s[0].id, &json!({ "amount": "5000" }))
            .await
            .expect("route");
        assert_eq!(large, Some(s[4].id));
        assert_eq!(small, Some(s[1].id));
    }

    #[tokio::test]
    async fn created_condition_round_trips_active() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 2).await;
        let rule = ConditionRule::RiskLevel {
            operator: CompareOperator::GreaterThan,
            value: "medium".to_owned(),
        };
        let created = condition(&engine, s[0].id, "Elevated risk", rule, Some(s[1].id)).await;

        let fetched = engine.get_step_conditions(s[0].id).await.expect("conditions");
        assert_eq!(fetched, vec![created.clone()]);
        assert!(fetched[0].is_active);
        assert_eq!(
            engine.get_workflow_conditions(wf.id).await.expect("conditions"),
            vec![created]
        );
    }

    #[tokio::test]
    async fn planner_creates_pending_rows_per_group() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Parallel).await;
        let b = engine
            .create_step(NewStep::parallel(wf.id, 1, "Legal", "legal", "G1", 2))
            .await
            .expect("step");
        let a = engine
            .create_step(NewStep::parallel(wf.id, 2, "Finance", "finance", "G1", 1))
            .await
            .expect("step");
        let c = engine
            .create_step(NewStep::parallel(wf.id, 3, "Security", "security", "G2", 1))
            .await
            .expect("step");

        let instance = Uuid::new_v4();
        let rows = engine.start_parallel_execution(instance, wf.id).await.expect("start");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.status == ExecutionStatus::Pending));

        let g1 = engine.get_parallel_group_executions(instance, "G1").await.expect("g1");
        assert_eq!(
            g1.iter().map(|row| (row.step_id, row.execution_order)).collect::<Vec<_>>(),
            vec![(a.id, 1), (b.id, 2)]
        );
        let g2 = engine.get_parallel_group_executions(instance, "G2").await.expect("g2");
        assert_eq!(g2.len(), 1);
        assert_eq!((g2[0].step_id, g2[0].execution_order), (c.id, 1));

        let again = engine.start_parallel_execution(instance, wf.id).await;
        assert!(matches!(again, Err(Error::Conflict(_))));
        assert_eq!(engine.get_parallel_executions(instance).await.expect("rows").len(), 3);
    }

    #[tokio::test]
    async fn sequential_workflow_has_no_parallel_start() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        sequential_steps(&engine, wf.id, 2).await;
        let instance = Uuid::new_v4();

        let err = engine
            .start_parallel_execution(instance, wf.id)
            .await
            .expect_err("sequential");
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(engine.get_parallel_executions(instance).await.expect("rows").is_empty());
    }

    #[tokio::test]
    async fn group_completion_follows_branch_status() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Parallel).await;
        for (order, name) in [(1, "Legal"), (2, "Finance"), (3, "Privacy")] {
            engine
                .create_step(NewStep::parallel(wf.id, order, name, "reviewer", "reviews", order))
                .await
                .expect("step");
        }
        let instance = Uuid::new_v4();
        let rows = engine.start_instance(instance, wf.id).await.expect("start").executions;
        let mut events = engine.subscribe();

        assert!(!engine.check_parallel_group_completion(instance, "reviews").await.expect("check"));

        engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::InProgress),
            )
            .await
            .expect("start branch");
        engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::Completed).by("ana"),
            )
            .await
            .expect("complete");
        engine
            .update_parallel_execution(
                rows[1].id,
                ExecutionUpdate::status(ExecutionStatus::Completed),
            )
            .await
            .expect("complete");
        assert!(!engine.check_parallel_group_completion(instance, "reviews").await.expect("check"));

        // a rejected branch leaves the group incomplete without failing it
        engine
            .update_parallel_execution(
                rows[2].id,
                ExecutionUpdate::status(ExecutionStatus::Rejected),
            )
            .await
            .expect("reject");
        assert!(!engine.check_parallel_group_completion(instance, "reviews").await.expect("check"));
        assert_eq!(
            engine.parallel_group_status(instance, "reviews").await.expect("status"),
            GroupStatus::Pending
        );

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::ExecutionUpdated { .. } => updates += 1,
                Event::GroupResolved { .. } => panic!("group must stay pending"),
                _ => {}
            }
        }
        assert_eq!(updates, 4);
    }

    #[tokio::test]
    async fn completing_every_branch_resolves_the_group() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Hybrid).await;
        engine
            .create_step(NewStep::sequential(wf.id, 1, "Intake", "analyst"))
            .await
            .expect("step");
        for order in [2, 3] {
            engine
                .create_step(NewStep::parallel(
                    wf.id,
                    order,
                    &format!("Review {order}"),
                    "reviewer",
                    "G1",
                    order,
                ))
                .await
                .expect("step");
        }
        let instance = Uuid::new_v4();
        let start = engine.start_instance(instance, wf.id).await.expect("start");
        assert_eq!(start.executions.len(), 2);
        assert!(start.first_step_id.is_some());

        let mut events = engine.subscribe();
        for row in &start.executions {
            engine
                .update_parallel_execution(
                    row.id,
                    ExecutionUpdate::status(ExecutionStatus::Completed).by("cfo"),
                )
                .await
                .expect("complete");
        }
        assert!(engine.check_parallel_group_completion(instance, "G1").await.expect("check"));

        let resolved = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| {
                matches!(
                    event,
                    Event::GroupResolved { status: GroupStatus::Complete, .. }
                )
            })
            .count();
        assert_eq!(resolved, 1);

        let status = engine.instance_status(instance, wf.id).await.expect("status");
        assert!(status.pinned);
        assert_eq!(status.groups.len(), 1);
        assert_eq!(status.groups[0].completed, 2);
        assert_eq!(status.groups[0].status, GroupStatus::Complete);
    }

    #[tokio::test]
    async fn fail_on_rejection_policy_fails_the_group() {
        let config = EngineConfig {
            rejection_policy: RejectionPolicy::FailOnRejection,
            ..EngineConfig::default()
        };
        let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), config);
        let wf = workflow(&engine, ExecutionType::Parallel).await;
        for order in [1, 2] {
            engine
                .create_step(NewStep::parallel(
                    wf.id,
                    order,
                    &format!("R{order}"),
                    "reviewer",
                    "G1",
                    order,
                ))
                .await
                .expect("step");
        }
        let instance = Uuid::new_v4();
        let rows = engine.start_parallel_execution(instance, wf.id).await.expect("start");
        engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::Rejected),
            )
            .await
            .expect("reject");
        assert_eq!(
            engine.parallel_group_status(instance, "G1").await.expect("status"),
            GroupStatus::Failed
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_refused() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Parallel).await;
        engine
            .create_step(NewStep::parallel(wf.id, 1, "Legal", "legal", "G1", 1))
            .await
            .expect("step");
        let instance = Uuid::new_v4();
        let rows = engine.start_parallel_execution(instance, wf.id).await.expect("start");

        let done = engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::Completed),
            )
            .await
            .expect("complete");
        let again = engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::Completed),
            )
            .await
            .expect("idempotent");
        assert_eq!(again, done);

        let err = engine
            .update_parallel_execution(
                rows[0].id,
                ExecutionUpdate::status(ExecutionStatus::Pending),
            )
            .await
            .expect_err("reopen");
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let missing = engine
            .update_parallel_execution(
                Uuid::new_v4(),
                ExecutionUpdate::status(ExecutionStatus::Completed),
            )
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn write_time_validation_rejects_bad_graphs() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Hybrid).await;
        let s = sequential_steps(&engine, wf.id, 3).await;
        let other = workflow(&engine, ExecutionType::Sequential).await;
        let foreign = sequential_steps(&engine, other.id, 1).await;

        let mut orphan = NewStep::sequential(wf.id, 4, "Orphan", "reviewer");
        orphan.is_parallel = true;
        assert!(matches!(engine.create_step(orphan).await, Err(Error::Validation(_))));

        let duplicate = NewStep::sequential(wf.id, 2, "Duplicate", "reviewer");
        assert!(matches!(engine.create_step(duplicate).await, Err(Error::Validation(_))));

        let cross = engine
            .create_workflow_condition(NewCondition {
                step_id: s[0].id,
                name: "cross".to_owned(),
                rule: custom(true),
                next_step_id: Some(foreign[0].id),
            })
            .await;
        assert!(matches!(cross, Err(Error::Validation(_))));

        let backward = engine
            .create_workflow_condition(NewCondition {
                step_id: s[2].id,
                name: "loop".to_owned(),
                rule: custom(true),
                next_step_id: Some(s[0].id),
            })
            .await;
        assert!(matches!(backward, Err(Error::Validation(_))));

        let bad_expression = engine
            .create_workflow_condition(NewCondition {
                step_id: s[0].id,
                name: "eval".to_owned(),
                rule: ConditionRule::Custom {
                    expression: "process.exit(1)".to_owned(),
                },
                next_step_id: Some(s[2].id),
            })
            .await;
        assert!(matches!(bad_expression, Err(Error::Validation(_))));

        let forward = condition(&engine, s[0].id, "skip", custom(true), Some(s[2].id)).await;
        let retarget = engine
            .update_workflow_condition(
                forward.id,
                ConditionPatch {
                    next_step_id: Some(Some(forward.step_id)),
                    ..ConditionPatch::default()
                },
            )
            .await;
        assert!(matches!(retarget, Err(Error::Validation(_))));

        let ungrouped = engine
            .update_conditional_step(
                s[1].id,
                StepPatch {
                    is_parallel: Some(true),
                    ..StepPatch::default()
                },
            )
            .await;
        assert!(matches!(ungrouped, Err(Error::Validation(_))));

        let grouped = engine
            .update_conditional_step(
                s[1].id,
                StepPatch {
                    is_parallel: Some(true),
                    parallel_group: Some(Some("G1".to_owned())),
                    parallel_order: Some(Some(1)),
                    ..StepPatch::default()
                },
            )
            .await
            .expect("grouped");
        assert_eq!(grouped.parallel_group_name(), Some("G1"));

        assert!(engine.validate_workflow(wf.id).await.expect("issues").is_empty());
    }

    #[tokio::test]
    async fn cycles_are_allowed_when_configured_and_bounded_on_walk() {
        let config = EngineConfig {
            allow_cyclic_routes: true,
            max_route_steps: 5,
            ..EngineConfig::default()
        };
        let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), config);
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 2).await;
        condition(&engine, s[1].id, "rework", custom(true), Some(s[0].id)).await;

        let err = engine
            .preview_route(wf.id, s[0].id, &json!({}))
            .await
            .expect_err("cycle");
        assert!(matches!(err, Error::RouteLimit { limit: 5, .. }));
    }

    #[tokio::test]
    async fn running_instances_keep_their_start_graph() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        let s = sequential_steps(&engine, wf.id, 3).await;
        let instance = Uuid::new_v4();
        let start = engine.start_instance(instance, wf.id).await.expect("start");
        assert_eq!(start.first_step_id, Some(s[0].id));
        assert!(start.executions.is_empty());

        condition(&engine, s[0].id, "fast track", custom(true), Some(s[2].id)).await;

        let pinned = engine
            .advance(instance, wf.id, s[0].id, &json!({}))
            .await
            .expect("advance");
        assert_eq!(pinned, RoutingDecision::Sequential { step_id: s[1].id });

        let fresh = engine
            .advance(Uuid::new_v4(), wf.id, s[0].id, &json!({}))
            .await
            .expect("advance");
        assert_eq!(fresh.next_step_id(), Some(s[2].id));

        let restart = engine.start_instance(instance, wf.id).await;
        assert!(matches!(restart, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn inactive_workflows_cannot_start() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Sequential).await;
        sequential_steps(&engine, wf.id, 1).await;
        let deactivated = engine.deactivate_workflow(wf.id).await.expect("deactivate");
        assert!(!deactivated.is_active);

        let err = engine
            .start_instance(Uuid::new_v4(), wf.id)
            .await
            .expect_err("inactive");
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn imported_bundle_runs_on_sqlite() {
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        let engine = WorkflowEngine::new(store, EngineConfig::default());
        let bundle = BundleLoader::parse_str(
            Path::new("incident.yaml"),
            r#"
workflow:
  name: Incident response
  entity_type: incident
  execution_type: hybrid
  convergence_step: Close out
steps:
  - name: Triage
    assignee_role: responder
    conditions:
      - name: Critical incident
        rule: { type: risk_level, operator: equals, value: critical }
        next_step: Executive briefing
  - name: Containment
    assignee_role: security
    parallel_group: response
    parallel_order: 1
  - name: Communications
    assignee_role: comms
    parallel_group: response
    parallel_order: 2
  - name: Executive briefing
    assignee_role: ciso
  - name: Close out
    assignee_role: responder
"#,
        )
        .expect("bundle");

        let imported = engine.import_bundle(&bundle).await.expect("import");
        let wf = imported.workflow.id;
        assert_eq!(imported.steps.len(), 5);
        assert_eq!(imported.conditions.len(), 1);
        let by_name = |name: &str| {
            imported
                .steps
                .iter()
                .find(|step| step.name == name)
                .map(|step| step.id)
                .expect("step")
        };
        assert_eq!(imported.workflow.convergence_step_id, Some(by_name("Close out")));

        let instance = Uuid::new_v4();
        let start = engine.start_instance(instance, wf).await.expect("start");
        assert_eq!(start.first_step_id, Some(by_name("Triage")));
        assert_eq!(start.executions.len(), 2);

        let decision = engine
            .advance(instance, wf, by_name("Triage"), &json!({ "risk_level": "critical" }))
            .await
            .expect("advance");
        assert_eq!(decision.next_step_id(), Some(by_name("Executive briefing")));

        let status = engine.instance_status(instance, wf).await.expect("status");
        assert_eq!(status.groups[0].name, "response");
        assert_eq!(status.groups[0].total, 2);
    }

    /// Delegates to a `MemoryStore`, failing the next instance start or
    /// import when armed.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        fail_start: std::sync::atomic::AtomicBool,
        fail_import: std::sync::atomic::AtomicBool,
    }

    fn disk_full() -> Error {
        Error::Storage("disk full".to_owned())
    }

    #[async_trait::async_trait]
    impl WorkflowStore for FailingStore {
        async fn create_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
            self.inner.create_workflow(workflow).await
        }
        async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
            self.inner.get_workflow(id).await
        }
        async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
            self.inner.list_workflows().await
        }
        async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
            self.inner.update_workflow(workflow).await
        }
        async fn create_step(&self, step: StepDefinition) -> Result<()> {
            self.inner.create_step(step).await
        }
        async fn get_step(&self, id: Uuid) -> Result<Option<StepDefinition>> {
            self.inner.get_step(id).await
        }
        async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<StepDefinition>> {
            self.inner.list_steps(workflow_id).await
        }
        async fn update_step(&self, step: &StepDefinition) -> Result<()> {
            self.inner.update_step(step).await
        }
        async fn insert_condition(&self, condition: Condition) -> Result<Condition> {
            self.inner.insert_condition(condition).await
        }
        async fn get_condition(&self, id: Uuid) -> Result<Option<Condition>> {
            self.inner.get_condition(id).await
        }
        async fn list_step_conditions(&self, step_id: Uuid) -> Result<Vec<Condition>> {
            self.inner.list_step_conditions(step_id).await
        }
        async fn list_workflow_conditions(&self, workflow_id: Uuid) -> Result<Vec<Condition>> {
            self.inner.list_workflow_conditions(workflow_id).await
        }
        async fn update_condition(&self, condition: &Condition) -> Result<()> {
            self.inner.update_condition(condition).await
        }
        async fn delete_condition(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_condition(id).await
        }
        async fn insert_executions(&self, executions: &[ParallelExecution]) -> Result<()> {
            self.inner.insert_executions(executions).await
        }
        async fn get_execution(&self, id: Uuid) -> Result<Option<ParallelExecution>> {
            self.inner.get_execution(id).await
        }
        async fn list_executions(&self, instance: Uuid) -> Result<Vec<ParallelExecution>> {
            self.inner.list_executions(instance).await
        }
        async fn list_group_executions(
            &self,
            instance: Uuid,
            group: &str,
        ) -> Result<Vec<ParallelExecution>> {
            self.inner.list_group_executions(instance, group).await
        }
        async fn update_execution(&self, execution: &ParallelExecution) -> Result<()> {
            self.inner.update_execution(execution).await
        }
        async fn save_instance_graph(&self, instance: Uuid, graph: &WorkflowGraph) -> Result<()> {
            self.inner.save_instance_graph(instance, graph).await
        }
        async fn get_instance_graph(&self, instance: Uuid) -> Result<Option<WorkflowGraph>> {
            self.inner.get_instance_graph(instance).await
        }
        async fn import_workflow(
            &self,
            workflow: &WorkflowDefinition,
            steps: &[StepDefinition],
            conditions: &[Condition],
        ) -> Result<Vec<Condition>> {
            if self.fail_import.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(disk_full());
            }
            self.inner.import_workflow(workflow, steps, conditions).await
        }
        async fn begin_instance(
            &self,
            instance: Uuid,
            executions: &[ParallelExecution],
            graph: Option<&WorkflowGraph>,
        ) -> Result<()> {
            if self.fail_start.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(disk_full());
            }
            self.inner.begin_instance(instance, executions, graph).await
        }
    }

    #[tokio::test]
    async fn failed_start_leaves_no_rows_and_can_be_retried() {
        let store = Arc::new(FailingStore::default());
        let engine = WorkflowEngine::new(store.clone(), EngineConfig::default());
        let wf = workflow(&engine, ExecutionType::Parallel).await;
        engine
            .create_step(NewStep::parallel(wf.id, 1, "Legal", "legal", "G1", 1))
            .await
            .expect("step");
        let instance = Uuid::new_v4();

        store.fail_start.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = engine.start_instance(instance, wf.id).await.expect_err("storage");
        assert!(matches!(err, Error::Storage(_)));
        assert!(engine.get_parallel_executions(instance).await.expect("rows").is_empty());
        assert!(store.get_instance_graph(instance).await.expect("graph").is_none());

        let start = engine.start_instance(instance, wf.id).await.expect("retry");
        assert_eq!(start.executions.len(), 1);
        assert!(start.snapshot_taken);
    }

    #[tokio::test]
    async fn failed_import_leaves_no_workflow() {
        let store = Arc::new(FailingStore::default());
        let engine = WorkflowEngine::new(store.clone(), EngineConfig::default());
        let bundle = BundleLoader::parse_str(
            Path::new("change.json"),
            r#"{
                "workflow": { "name": "Change approval", "entity_type": "change" },
                "steps": [
                    { "name": "Review", "assignee_role": "cab" },
                    { "name": "Approve", "assignee_role": "cab_chair" }
                ]
            }"#,
        )
        .expect("bundle");

        store.fail_import.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = engine.import_bundle(&bundle).await.expect_err("storage");
        assert!(matches!(err, Error::Storage(_)));
        assert!(engine.list_workflows().await.expect("list").is_empty());

        let imported = engine.import_bundle(&bundle).await.expect("retry");
        assert_eq!(engine.list_workflows().await.expect("list"), vec![imported.workflow]);
    }

    #[tokio::test]
    async fn first_step_skips_leading_parallel_branches() {
        let engine = engine();
        let wf = workflow(&engine, ExecutionType::Hybrid).await;
        engine
            .create_step(NewStep::parallel(wf.id, 1, "Legal", "legal", "G1", 1))
            .await
            .expect("step");
        let sequential = engine
            .create_step(NewStep::sequential(wf.id, 2, "Sign-off", "owner"))
            .await
            .expect("step");

        let start = engine.start_instance(Uuid::new_v4(), wf.id).await.expect("start");
        assert_eq!(start.first_step_id, Some(sequential.id));
        assert_eq!(start.executions.len(), 1);
    }
}
