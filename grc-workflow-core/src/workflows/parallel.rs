use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{ExecutionStatus, ExecutionUpdate, ParallelExecution, StepDefinition};
use crate::error::{Error, Result};

/// How a `rejected` branch affects its group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Every branch must be completed; a rejection leaves the group pending.
    #[default]
    Strict,
    /// Rejected branches are left out of the completion check.
    ExcludeRejected,
    /// Any rejected branch fails the group.
    FailOnRejection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Complete,
    Failed,
}

/// One step's slot within a planned parallel group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBranch {
    pub step_id: Uuid,
    pub execution_order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedGroup {
    pub name: String,
    pub branches: Vec<PlannedBranch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelPlan {
    pub groups: Vec<PlannedGroup>,
    /// Steps flagged parallel without a group name.
    pub skipped: Vec<Uuid>,
}

impl ParallelPlan {
    pub fn branch_count(&self) -> usize {
        self.groups.iter().map(|group| group.branches.len()).sum()
    }

    /// Pending execution rows for one workflow instance.
    pub fn materialize(&self, approval_request_id: Uuid) -> Vec<ParallelExecution> {
        let now = Utc::now();
        self.groups
            .iter()
            .flat_map(|group| {
                group.branches.iter().map(move |branch| ParallelExecution {
                    id: Uuid::new_v4(),
                    approval_request_id,
                    parallel_group: group.name.clone(),
                    step_id: branch.step_id,
                    status: ExecutionStatus::Pending,
                    execution_order: branch.execution_order,
                    started_at: None,
                    completed_at: None,
                    completed_by: None,
                    notes: None,
                    created_at: now,
                })
            })
            .collect()
    }
}

/// Partitions parallel steps into groups. Groups keep the order in which they
/// first appear in `steps`; branches are ordered by `parallel_order`, then by
/// their position in `steps`.
pub fn plan_parallel_groups(steps: &[StepDefinition]) -> ParallelPlan {
    let mut plan = ParallelPlan::default();
    let mut members: Vec<(String, Vec<(i32, usize, Uuid)>)> = Vec::new();

    for (position, step) in steps.iter().filter(|step| step.is_parallel).enumerate() {
        let Some(group) = step.parallel_group_name() else {
            tracing::warn!(
                step_id = %step.id,
                workflow_id = %step.workflow_id,
                "parallel step has no parallel_group; skipping"
            );
            plan.skipped.push(step.id);
            continue;
        };
        let order = step.parallel_order.unwrap_or(i32::MAX);
        match members.iter_mut().find(|(name, _)| name == group) {
            Some((_, list)) => list.push((order, position, step.id)),
            None => members.push((group.to_owned(), vec![(order, position, step.id)])),
        }
    }

    for (name, mut list) in members {
        list.sort_by_key(|(order, position, _)| (*order, *position));
        let branches = list
            .into_iter()
            .enumerate()
            .map(|(index, (_, _, step_id))| PlannedBranch {
                step_id,
                execution_order: index as i32 + 1,
            })
            .collect();
        plan.groups.push(PlannedGroup { name, branches });
    }

    plan
}

/// Resolves a group from its execution rows. A group with no rows is pending.
pub fn group_status(executions: &[ParallelExecution], policy: RejectionPolicy) -> GroupStatus {
    if executions.is_empty() {
        return GroupStatus::Pending;
    }

    let rejected = executions
        .iter()
        .any(|execution| execution.status == ExecutionStatus::Rejected);
    if rejected && policy == RejectionPolicy::FailOnRejection {
        return GroupStatus::Failed;
    }

    let considered: Vec<&ParallelExecution> = match policy {
        RejectionPolicy::ExcludeRejected => executions
            .iter()
            .filter(|execution| execution.status != ExecutionStatus::Rejected)
            .collect(),
        RejectionPolicy::Strict | RejectionPolicy::FailOnRejection => executions.iter().collect(),
    };

    if !considered.is_empty()
        && considered
            .iter()
            .all(|execution| execution.status == ExecutionStatus::Completed)
    {
        GroupStatus::Complete
    } else {
        GroupStatus::Pending
    }
}

/// Outcome of applying an update to an execution row.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Changed(ParallelExecution),
    /// The row already holds the requested terminal status.
    Unchanged(ParallelExecution),
}

/// Applies `update` to `current`, stamping timestamps. With `enforce` the
/// lifecycle `pending -> in_progress -> completed | rejected` is checked.
pub fn apply_update(
    current: &ParallelExecution,
    update: &ExecutionUpdate,
    enforce: bool,
) -> Result<TransitionOutcome> {
    let from = current.status;
    let to = update.status;

    if from == to && from.is_terminal() {
        return Ok(TransitionOutcome::Unchanged(current.clone()));
    }
    if enforce && !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    let now = Utc::now();
    let mut next = current.clone();
    next.status = to;
    if to == ExecutionStatus::InProgress && next.started_at.is_none() {
        next.started_at = Some(now);
    }
    if to.is_terminal() {
        next.completed_at = Some(now);
        if update.completed_by.is_some() {
            next.completed_by = update.completed_by.clone();
        }
    }
    if update.notes.is_some() {
        next.notes = update.notes.clone();
    }
    Ok(TransitionOutcome::Changed(next))
}
