use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::conditions::ConditionEvaluator;
use super::types::WorkflowGraph;
use crate::error::{Error, Result};

/// Where an instance goes after a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingDecision {
    /// A condition on the current step matched and redirected the flow.
    Branch { condition_id: Uuid, step_id: Uuid },
    /// No condition matched; the next step by `step_order` follows.
    Sequential { step_id: Uuid },
    /// The current step is the last one, or is not part of the workflow.
    Complete,
}

impl RoutingDecision {
    pub fn next_step_id(&self) -> Option<Uuid> {
        match self {
            Self::Branch { step_id, .. } | Self::Sequential { step_id } => Some(*step_id),
            Self::Complete => None,
        }
    }
}

/// First-match conditional routing with a sequential fallback.
///
/// Routing reads only the graph handed to it; loading and snapshotting the
/// graph is the caller's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRouter {
    evaluator: ConditionEvaluator,
}

impl SequentialRouter {
    pub fn new(evaluator: ConditionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn route(
        &self,
        graph: &WorkflowGraph,
        current_step_id: Uuid,
        snapshot: &Value,
    ) -> RoutingDecision {
        for condition in graph.step_conditions(current_step_id) {
            if !condition.is_active {
                continue;
            }
            let Some(target) = condition.next_step_id else {
                continue;
            };
            if self.evaluator.evaluate(condition, snapshot) {
                tracing::debug!(
                    step_id = %current_step_id,
                    condition_id = %condition.id,
                    next_step_id = %target,
                    "condition matched"
                );
                return RoutingDecision::Branch {
                    condition_id: condition.id,
                    step_id: target,
                };
            }
        }

        match graph.sequential_successor(current_step_id) {
            Some(step) => RoutingDecision::Sequential { step_id: step.id },
            None => RoutingDecision::Complete,
        }
    }

    pub fn next_step(
        &self,
        graph: &WorkflowGraph,
        current_step_id: Uuid,
        snapshot: &Value,
    ) -> Option<Uuid> {
        self.route(graph, current_step_id, snapshot).next_step_id()
    }

    /// Follows routing decisions from `start` until completion, returning the
    /// visited steps including `start`. Fails once more than `max_steps`
    /// steps have been visited, which is how a cyclic route surfaces.
    pub fn walk(
        &self,
        graph: &WorkflowGraph,
        start: Uuid,
        snapshot: &Value,
        max_steps: usize,
    ) -> Result<Vec<Uuid>> {
        let mut path = vec![start];
        let mut current = start;
        while let Some(next) = self.next_step(graph, current, snapshot) {
            if path.len() >= max_steps {
                return Err(Error::RouteLimit {
                    start,
                    limit: max_steps,
                });
            }
            path.push(next);
            current = next;
        }
        Ok(path)
    }
}
