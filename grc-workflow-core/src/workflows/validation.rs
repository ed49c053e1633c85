use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use super::expressions::{compile, EvaluationOptions};
use super::types::{CompareOperator, ConditionRule, StepDefinition, WorkflowGraph};
use super::conditions::RiskLevel;
use crate::error::{Error, Result};

/// A configuration problem in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum GraphIssue {
    ParallelWithoutGroup { step_id: Uuid },
    DuplicateStepOrder { step_order: i32 },
    UnknownTarget { condition_id: Uuid, next_step_id: Uuid },
    SelfTarget { condition_id: Uuid },
    OrphanCondition { condition_id: Uuid, step_id: Uuid },
    UnknownConvergenceStep { step_id: Uuid },
    Cycle { step_ids: Vec<Uuid> },
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParallelWithoutGroup { step_id } => {
                write!(f, "step '{step_id}' is parallel but has no parallel_group")
            }
            Self::DuplicateStepOrder { step_order } => {
                write!(f, "step_order {step_order} is used by more than one step")
            }
            Self::UnknownTarget {
                condition_id,
                next_step_id,
            } => write!(
                f,
                "condition '{condition_id}' targets step '{next_step_id}' which is not in this workflow"
            ),
            Self::SelfTarget { condition_id } => {
                write!(f, "condition '{condition_id}' routes back to its own step")
            }
            Self::OrphanCondition {
                condition_id,
                step_id,
            } => write!(
                f,
                "condition '{condition_id}' is attached to unknown step '{step_id}'"
            ),
            Self::UnknownConvergenceStep { step_id } => {
                write!(f, "convergence step '{step_id}' is not in this workflow")
            }
            Self::Cycle { step_ids } => {
                let path = step_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                write!(f, "routes can loop: {path}")
            }
        }
    }
}

/// Checks that a rule can ever evaluate, so broken rules are refused when
/// they are written rather than silently failing closed at runtime.
pub fn validate_rule(rule: &ConditionRule, options: EvaluationOptions) -> Result<()> {
    match rule {
        ConditionRule::FieldValue {
            value, field_path, ..
        } => {
            if let Some(path) = field_path {
                if path.split('.').any(|segment| segment.trim().is_empty()) {
                    return Err(Error::Validation(format!(
                        "field_path '{path}' has an empty segment"
                    )));
                }
            }
            if value.is_empty() {
                return Err(Error::Validation(
                    "field_value condition needs a comparison value".to_owned(),
                ));
            }
        }
        ConditionRule::RiskLevel { operator, value } => {
            if *operator != CompareOperator::Equals && RiskLevel::parse(value).is_none() {
                return Err(Error::Validation(format!(
                    "risk level '{value}' is not one of low, medium, high, critical"
                )));
            }
        }
        ConditionRule::AmountThreshold { value, .. } => {
            let parsed = value.trim().parse::<f64>().ok().filter(|n| n.is_finite());
            if parsed.is_none() {
                return Err(Error::Validation(format!(
                    "amount threshold '{value}' is not a number"
                )));
            }
        }
        ConditionRule::UserRole { value, .. } => {
            if value.split(',').all(|role| role.trim().is_empty()) {
                return Err(Error::Validation(
                    "user_role condition needs at least one role".to_owned(),
                ));
            }
        }
        ConditionRule::Custom { expression } => {
            compile(expression, options).map_err(|err| {
                Error::Validation(format!("invalid custom expression: {err}"))
            })?;
        }
    }
    Ok(())
}

pub fn validate_step_shape(step: &StepDefinition) -> Result<()> {
    if step.name.trim().is_empty() {
        return Err(Error::Validation("step name cannot be empty".to_owned()));
    }
    if step.is_parallel && step.parallel_group_name().is_none() {
        return Err(Error::Validation(format!(
            "step '{}' is parallel but has no parallel_group",
            step.name
        )));
    }
    Ok(())
}

/// Every configuration problem in `graph`. Cycles are reported unless
/// `allow_cycles` is set.
pub fn graph_issues(graph: &WorkflowGraph, allow_cycles: bool) -> Vec<GraphIssue> {
    let mut issues = Vec::new();
    let step_ids: HashSet<Uuid> = graph.steps.iter().map(|step| step.id).collect();

    let mut orders = HashSet::new();
    for step in &graph.steps {
        if step.is_parallel && step.parallel_group_name().is_none() {
            issues.push(GraphIssue::ParallelWithoutGroup { step_id: step.id });
        }
        if !orders.insert(step.step_order) {
            issues.push(GraphIssue::DuplicateStepOrder {
                step_order: step.step_order,
            });
        }
    }

    if let Some(convergence) = graph.workflow.convergence_step_id {
        if !step_ids.contains(&convergence) {
            issues.push(GraphIssue::UnknownConvergenceStep {
                step_id: convergence,
            });
        }
    }

    for (step_id, conditions) in &graph.conditions {
        for condition in conditions {
            if !step_ids.contains(step_id) {
                issues.push(GraphIssue::OrphanCondition {
                    condition_id: condition.id,
                    step_id: *step_id,
                });
            }
            let Some(target) = condition.next_step_id else {
                continue;
            };
            if target == *step_id {
                issues.push(GraphIssue::SelfTarget {
                    condition_id: condition.id,
                });
            } else if !step_ids.contains(&target) {
                issues.push(GraphIssue::UnknownTarget {
                    condition_id: condition.id,
                    next_step_id: target,
                });
            }
        }
    }

    if !allow_cycles {
        if let Some(step_ids) = find_cycle(graph) {
            issues.push(GraphIssue::Cycle { step_ids });
        }
    }

    issues
}

/// Looks for a loop over sequential successors plus active condition targets.
fn find_cycle(graph: &WorkflowGraph) -> Option<Vec<Uuid>> {
    let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for step in &graph.steps {
        let targets = edges.entry(step.id).or_default();
        targets.extend(
            graph
                .step_conditions(step.id)
                .iter()
                .filter(|condition| condition.is_active)
                .filter_map(|condition| condition.next_step_id),
        );
        if let Some(next) = graph.sequential_successor(step.id) {
            targets.push(next.id);
        }
    }

    fn dfs(
        node: Uuid,
        edges: &HashMap<Uuid, Vec<Uuid>>,
        stack: &mut Vec<Uuid>,
        visited: &mut HashSet<Uuid>,
    ) -> Option<Vec<Uuid>> {
        if let Some(start) = stack.iter().position(|id| *id == node) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        for next in edges.get(&node).into_iter().flatten() {
            if let Some(cycle) = dfs(*next, edges, stack, visited) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    let mut visited = HashSet::new();
    for step in &graph.steps {
        let mut stack = Vec::new();
        if let Some(cycle) = dfs(step.id, &edges, &mut stack, &mut visited) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::types::{Condition, ExecutionType, WorkflowDefinition};
    use chrono::Utc;

    fn graph(step_count: i32, links: &[(usize, usize)]) -> WorkflowGraph {
        let workflow = WorkflowDefinition {
            id: Uuid::new_v4(),
            name: "Incident response".to_owned(),
            entity_type: "incident".to_owned(),
            is_active: true,
            execution_type: ExecutionType::Sequential,
            convergence_step_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let steps: Vec<StepDefinition> = (1..=step_count)
            .map(|order| StepDefinition {
                id: Uuid::new_v4(),
                workflow_id: workflow.id,
                step_order: order,
                name: format!("S{order}"),
                assignee_role: "responder".to_owned(),
                required: true,
                is_parallel: false,
                parallel_group: None,
                parallel_order: None,
                created_at: Utc::now(),
            })
            .collect();
        let conditions = links
            .iter()
            .enumerate()
            .map(|(index, (from, to))| Condition {
                id: Uuid::new_v4(),
                step_id: steps[*from].id,
                name: format!("link{index}"),
                rule: ConditionRule::Custom {
                    expression: "true".to_owned(),
                },
                next_step_id: Some(steps[*to].id),
                is_active: true,
                sequence: index as i64,
                created_at: Utc::now(),
            })
            .collect();
        WorkflowGraph::new(workflow, steps, conditions)
    }

    #[test]
    fn rejects_deeply_nested_custom_rules() {
        let rule = ConditionRule::Custom {
            expression: format!("{}true", "!".repeat(4_000)),
        };
        assert!(matches!(
            validate_rule(&rule, EvaluationOptions::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn forward_jumps_are_valid() {
        let graph = graph(4, &[(0, 3), (1, 3)]);
        assert!(graph_issues(&graph, false).is_empty());
    }

    #[test]
    fn backward_jump_is_a_cycle() {
        let graph = graph(3, &[(2, 0)]);
        let issues = graph_issues(&graph, false);
        assert!(matches!(issues.as_slice(), [GraphIssue::Cycle { .. }]));
        assert!(graph_issues(&graph, true).is_empty());
    }

    #[test]
    fn reports_self_and_unknown_targets() {
        let mut graph = graph(2, &[(0, 0)]);
        let stray = Uuid::new_v4();
        let first = graph.steps[0].id;
        if let Some(list) = graph.conditions.get_mut(&first) {
            let mut extra = list[0].clone();
            extra.id = Uuid::new_v4();
            extra.next_step_id = Some(stray);
            list.push(extra);
        }
        let issues = graph_issues(&graph, true);
        assert!(issues.iter().any(|issue| matches!(issue, GraphIssue::SelfTarget { .. })));
        assert!(issues.iter().any(|issue| matches!(
            issue,
            GraphIssue::UnknownTarget { next_step_id, .. } if *next_step_id == stray
        )));
    }

    #[test]
    fn reports_parallel_without_group_and_duplicate_order() {
        let mut graph = graph(2, &[]);
        graph.steps[1].is_parallel = true;
        graph.steps[1].step_order = 1;
        let issues = graph_issues(&graph, false);
        assert!(issues.contains(&GraphIssue::ParallelWithoutGroup {
            step_id: graph.steps[1].id
        }));
        assert!(issues.contains(&GraphIssue::DuplicateStepOrder { step_order: 1 }));
    }

    #[test]
    fn rejects_unusable_rules() {
        let options = EvaluationOptions::default();
        let bad = [
            ConditionRule::AmountThreshold {
                operator: CompareOperator::GreaterThan,
                value: "ten thousand".to_owned(),
            },
            ConditionRule::RiskLevel {
                operator: CompareOperator::GreaterThan,
                value: "severe".to_owned(),
            },
            ConditionRule::Custom {
                expression: "eval('x')".to_owned(),
            },
        ];
        for rule in bad {
            assert!(validate_rule(&rule, options).is_err(), "{rule:?}");
        }
        assert!(validate_rule(
            &ConditionRule::Custom {
                expression: "${amount} > 10".to_owned()
            },
            options
        )
        .is_ok());
    }
}
