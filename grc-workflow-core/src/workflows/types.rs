use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Sequential,
    Parallel,
    Hybrid,
}

impl ExecutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::Validation(format!(
                "unknown execution type '{other}'"
            ))),
        }
    }

    /// Parallel and hybrid workflows materialize execution rows on start.
    pub fn uses_parallel_groups(self) -> bool {
        matches!(self, Self::Parallel | Self::Hybrid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    pub is_active: bool,
    pub execution_type: ExecutionType,
    pub convergence_step_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NewWorkflow {
    pub name: String,
    pub entity_type: String,
    pub execution_type: ExecutionType,
    pub convergence_step_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub entity_type: Option<String>,
    pub is_active: Option<bool>,
    pub execution_type: Option<ExecutionType>,
    pub convergence_step_id: Option<Option<Uuid>>,
}

impl WorkflowPatch {
    pub fn apply(&self, workflow: &mut WorkflowDefinition) {
        if let Some(name) = &self.name {
            workflow.name = name.clone();
        }
        if let Some(entity_type) = &self.entity_type {
            workflow.entity_type = entity_type.clone();
        }
        if let Some(active) = self.is_active {
            workflow.is_active = active;
        }
        if let Some(execution_type) = self.execution_type {
            workflow.execution_type = execution_type;
        }
        if let Some(convergence) = self.convergence_step_id {
            workflow.convergence_step_id = convergence;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_order: i32,
    pub name: String,
    pub assignee_role: String,
    pub required: bool,
    pub is_parallel: bool,
    pub parallel_group: Option<String>,
    pub parallel_order: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl StepDefinition {
    /// Group name of a well-formed parallel step. `None` for sequential steps
    /// and for steps flagged parallel without a usable group.
    pub fn parallel_group_name(&self) -> Option<&str> {
        if !self.is_parallel {
            return None;
        }
        self.parallel_group
            .as_deref()
            .map(str::trim)
            .filter(|group| !group.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub workflow_id: Uuid,
    pub step_order: i32,
    pub name: String,
    pub assignee_role: String,
    pub required: bool,
    pub is_parallel: bool,
    pub parallel_group: Option<String>,
    pub parallel_order: Option<i32>,
}

impl NewStep {
    pub fn sequential(workflow_id: Uuid, step_order: i32, name: &str, assignee_role: &str) -> Self {
        Self {
            workflow_id,
            step_order,
            name: name.to_owned(),
            assignee_role: assignee_role.to_owned(),
            required: true,
            is_parallel: false,
            parallel_group: None,
            parallel_order: None,
        }
    }

    pub fn parallel(
        workflow_id: Uuid,
        step_order: i32,
        name: &str,
        assignee_role: &str,
        group: &str,
        parallel_order: i32,
    ) -> Self {
        Self {
            is_parallel: true,
            parallel_group: Some(group.to_owned()),
            parallel_order: Some(parallel_order),
            ..Self::sequential(workflow_id, step_order, name, assignee_role)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub name: Option<String>,
    pub assignee_role: Option<String>,
    pub required: Option<bool>,
    pub step_order: Option<i32>,
    pub is_parallel: Option<bool>,
    pub parallel_group: Option<Option<String>>,
    pub parallel_order: Option<Option<i32>>,
}

impl StepPatch {
    pub fn apply(&self, step: &mut StepDefinition) {
        if let Some(name) = &self.name {
            step.name = name.clone();
        }
        if let Some(role) = &self.assignee_role {
            step.assignee_role = role.clone();
        }
        if let Some(required) = self.required {
            step.required = required;
        }
        if let Some(order) = self.step_order {
            step.step_order = order;
        }
        if let Some(is_parallel) = self.is_parallel {
            step.is_parallel = is_parallel;
        }
        if let Some(group) = &self.parallel_group {
            step.parallel_group = group.clone();
        }
        if let Some(order) = self.parallel_order {
            step.parallel_order = order;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperator {
    Equals,
    NotEquals,
    Contains,
    In,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    Equals,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoleOperator {
    Equals,
    In,
}

/// What a condition tests. Each kind carries only the operators and
/// metadata that make sense for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionRule {
    FieldValue {
        operator: FieldOperator,
        #[serde(deserialize_with = "scalar_string")]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field_path: Option<String>,
    },
    RiskLevel {
        operator: CompareOperator,
        #[serde(deserialize_with = "scalar_string")]
        value: String,
    },
    AmountThreshold {
        operator: CompareOperator,
        #[serde(deserialize_with = "scalar_string")]
        value: String,
    },
    UserRole {
        operator: RoleOperator,
        #[serde(deserialize_with = "scalar_string")]
        value: String,
    },
    Custom {
        expression: String,
    },
}

fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a scalar comparison value, got {other}"
        ))),
    }
}

/// Flat column form of a [`ConditionRule`] as stored in `workflow_conditions`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleColumns {
    pub condition_type: String,
    pub operator: String,
    pub condition_value: String,
    pub condition_metadata: Option<Value>,
}

impl ConditionRule {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::FieldValue { .. } => "field_value",
            Self::RiskLevel { .. } => "risk_level",
            Self::AmountThreshold { .. } => "amount_threshold",
            Self::UserRole { .. } => "user_role",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn operator_name(&self) -> &'static str {
        match self {
            Self::FieldValue { operator, .. } => match operator {
                FieldOperator::Equals => "equals",
                FieldOperator::NotEquals => "not_equals",
                FieldOperator::Contains => "contains",
                FieldOperator::In => "in",
            },
            Self::RiskLevel { operator, .. } | Self::AmountThreshold { operator, .. } => {
                match operator {
                    CompareOperator::Equals => "equals",
                    CompareOperator::GreaterThan => "greater_than",
                    CompareOperator::LessThan => "less_than",
                }
            }
            Self::UserRole { operator, .. } => match operator {
                RoleOperator::Equals => "equals",
                RoleOperator::In => "in",
            },
            Self::Custom { .. } => "custom",
        }
    }

    pub fn to_columns(&self) -> RuleColumns {
        let (condition_value, condition_metadata) = match self {
            Self::FieldValue {
                value, field_path, ..
            } => (
                value.clone(),
                field_path
                    .as_ref()
                    .map(|path| serde_json::json!({ "field_path": path })),
            ),
            Self::RiskLevel { value, .. }
            | Self::AmountThreshold { value, .. }
            | Self::UserRole { value, .. } => (value.clone(), None),
            Self::Custom { expression } => (
                String::new(),
                Some(serde_json::json!({ "expression": expression })),
            ),
        };

        RuleColumns {
            condition_type: self.kind_name().to_owned(),
            operator: self.operator_name().to_owned(),
            condition_value,
            condition_metadata,
        }
    }

    pub fn from_columns(columns: &RuleColumns) -> Result<Self> {
        let value = columns.condition_value.clone();
        let metadata_str = |key: &str| {
            columns
                .condition_metadata
                .as_ref()
                .and_then(|metadata| metadata.get(key))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        let invalid = || {
            Error::Validation(format!(
                "operator '{}' is not valid for condition type '{}'",
                columns.operator, columns.condition_type
            ))
        };

        let rule = match columns.condition_type.as_str() {
            "field_value" => Self::FieldValue {
                operator: match columns.operator.as_str() {
                    "equals" => FieldOperator::Equals,
                    "not_equals" => FieldOperator::NotEquals,
                    "contains" => FieldOperator::Contains,
                    "in" => FieldOperator::In,
                    _ => return Err(invalid()),
                },
                value,
                field_path: metadata_str("field_path"),
            },
            "risk_level" | "amount_threshold" => {
                let operator = match columns.operator.as_str() {
                    "equals" => CompareOperator::Equals,
                    "greater_than" => CompareOperator::GreaterThan,
                    "less_than" => CompareOperator::LessThan,
                    _ => return Err(invalid()),
                };
                if columns.condition_type == "risk_level" {
                    Self::RiskLevel { operator, value }
                } else {
                    Self::AmountThreshold { operator, value }
                }
            }
            "user_role" => Self::UserRole {
                operator: match columns.operator.as_str() {
                    "equals" => RoleOperator::Equals,
                    "in" => RoleOperator::In,
                    _ => return Err(invalid()),
                },
                value,
            },
            "custom" => {
                if columns.operator != "custom" {
                    return Err(invalid());
                }
                let expression = metadata_str("expression").ok_or_else(|| {
                    Error::Validation("custom condition is missing metadata.expression".to_owned())
                })?;
                Self::Custom { expression }
            }
            other => {
                return Err(Error::Validation(format!(
                    "unknown condition type '{other}'"
                )))
            }
        };
        Ok(rule)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub id: Uuid,
    pub step_id: Uuid,
    pub name: String,
    pub rule: ConditionRule,
    pub next_step_id: Option<Uuid>,
    pub is_active: bool,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCondition {
    pub step_id: Uuid,
    pub name: String,
    pub rule: ConditionRule,
    pub next_step_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionPatch {
    pub name: Option<String>,
    pub rule: Option<ConditionRule>,
    pub next_step_id: Option<Option<Uuid>>,
    pub is_active: Option<bool>,
}

impl ConditionPatch {
    pub fn apply(&self, condition: &mut Condition) {
        if let Some(name) = &self.name {
            condition.name = name.clone();
        }
        if let Some(rule) = &self.rule {
            condition.rule = rule.clone();
        }
        if let Some(next) = self.next_step_id {
            condition.next_step_id = next;
        }
        if let Some(active) = self.is_active {
            condition.is_active = active;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::Validation(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    /// A pending branch may be decided without being picked up first.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Rejected)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Rejected)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelExecution {
    pub id: Uuid,
    pub approval_request_id: Uuid,
    pub parallel_group: String,
    pub step_id: Uuid,
    pub status: ExecutionStatus,
    pub execution_order: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub completed_by: Option<String>,
    pub notes: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            completed_by: None,
            notes: None,
        }
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.completed_by = Some(actor.to_owned());
        self
    }
}

/// Everything routing needs for one workflow: steps sorted by `step_order`
/// and active-or-not conditions per step in creation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowGraph {
    pub workflow: WorkflowDefinition,
    pub steps: Vec<StepDefinition>,
    pub conditions: BTreeMap<Uuid, Vec<Condition>>,
}

impl WorkflowGraph {
    pub fn new(
        workflow: WorkflowDefinition,
        mut steps: Vec<StepDefinition>,
        conditions: Vec<Condition>,
    ) -> Self {
        steps.sort_by_key(|step| step.step_order);
        let mut by_step: BTreeMap<Uuid, Vec<Condition>> = BTreeMap::new();
        for condition in conditions {
            by_step.entry(condition.step_id).or_default().push(condition);
        }
        for list in by_step.values_mut() {
            list.sort_by_key(|condition| condition.sequence);
        }
        Self {
            workflow,
            steps,
            conditions: by_step,
        }
    }

    pub fn step(&self, step_id: Uuid) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// First step by `step_order` that is not a parallel branch.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| !step.is_parallel)
    }

    pub fn step_conditions(&self, step_id: Uuid) -> &[Condition] {
        self.conditions
            .get(&step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The step immediately after `step_id` by `step_order`.
    pub fn sequential_successor(&self, step_id: Uuid) -> Option<&StepDefinition> {
        let index = self.steps.iter().position(|step| step.id == step_id)?;
        self.steps.get(index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_columns_round_trip_every_kind() {
        let rules = vec![
            ConditionRule::FieldValue {
                operator: FieldOperator::In,
                value: "finance,legal".to_owned(),
                field_path: Some("owner.department".to_owned()),
            },
            ConditionRule::RiskLevel {
                operator: CompareOperator::GreaterThan,
                value: "medium".to_owned(),
            },
            ConditionRule::AmountThreshold {
                operator: CompareOperator::LessThan,
                value: "500".to_owned(),
            },
            ConditionRule::UserRole {
                operator: RoleOperator::Equals,
                value: "auditor".to_owned(),
            },
            ConditionRule::Custom {
                expression: "${amount} > 10".to_owned(),
            },
        ];

        for rule in rules {
            let columns = rule.to_columns();
            let decoded = ConditionRule::from_columns(&columns).expect("decode");
            assert_eq!(decoded, rule);
        }
    }

    #[test]
    fn rejects_operator_from_another_kind() {
        let columns = RuleColumns {
            condition_type: "user_role".to_owned(),
            operator: "greater_than".to_owned(),
            condition_value: "admin".to_owned(),
            condition_metadata: None,
        };
        let error = ConditionRule::from_columns(&columns).expect_err("must reject");
        assert!(error.to_string().contains("not valid for condition type"));
    }

    #[test]
    fn deserializes_numeric_comparison_values() {
        let rule: ConditionRule = serde_json::from_value(serde_json::json!({
            "type": "amount_threshold",
            "operator": "greater_than",
            "value": 10000
        }))
        .expect("deserialize");
        assert_eq!(
            rule,
            ConditionRule::AmountThreshold {
                operator: CompareOperator::GreaterThan,
                value: "10000".to_owned(),
            }
        );
    }

    #[test]
    fn execution_transitions_follow_lifecycle() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Rejected));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Rejected.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
    }
}
