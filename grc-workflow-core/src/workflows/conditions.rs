use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::expressions::{compile, EvaluationOptions, ExpressionError};
use super::paths::{first_field, lookup_path, value_to_string};
use super::types::{CompareOperator, Condition, ConditionRule, FieldOperator, RoleOperator};

/// How `amount_threshold` treats an amount that is missing or not numeric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AmountParsing {
    /// Unparseable amounts never match.
    #[default]
    Strict,
    /// Unparseable amounts are read as `0`.
    ZeroDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl RiskLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        self as u8
    }
}

pub const RISK_FIELDS: [&str; 2] = ["risk_level", "severity"];
pub const AMOUNT_FIELDS: [&str; 2] = ["amount", "value"];
pub const ROLE_FIELDS: [&str; 2] = ["user_role", "role"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluatorOptions {
    pub amount_parsing: AmountParsing,
    pub expression: EvaluationOptions,
}

/// Tests conditions against entity snapshots. Evaluation is total: anything
/// that cannot be evaluated is reported as `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator {
    options: EvaluatorOptions,
}

impl ConditionEvaluator {
    pub fn new(options: EvaluatorOptions) -> Self {
        Self { options }
    }

    pub fn evaluate(&self, condition: &Condition, snapshot: &Value) -> bool {
        if !condition.is_active {
            return false;
        }
        let matched = self.evaluate_rule(&condition.rule, snapshot);
        tracing::trace!(
            condition_id = %condition.id,
            kind = condition.rule.kind_name(),
            matched,
            "evaluated condition"
        );
        matched
    }

    pub fn evaluate_rule(&self, rule: &ConditionRule, snapshot: &Value) -> bool {
        match rule {
            ConditionRule::FieldValue {
                operator,
                value,
                field_path,
            } => {
                let Some(field) = lookup_path(snapshot, field_path.as_deref()) else {
                    return false;
                };
                field_matches(field, *operator, value)
            }
            ConditionRule::RiskLevel { operator, value } => {
                let Some(actual) = first_field(snapshot, &RISK_FIELDS).and_then(Value::as_str)
                else {
                    return false;
                };
                risk_matches(actual, *operator, value)
            }
            ConditionRule::AmountThreshold { operator, value } => {
                let parsed = first_field(snapshot, &AMOUNT_FIELDS).and_then(parse_amount);
                let amount = match (parsed, self.options.amount_parsing) {
                    (Some(amount), _) => amount,
                    (None, AmountParsing::ZeroDefault) => 0.0,
                    (None, AmountParsing::Strict) => return false,
                };
                let Ok(threshold) = value.trim().parse::<f64>() else {
                    return false;
                };
                match operator {
                    CompareOperator::GreaterThan => amount > threshold,
                    CompareOperator::LessThan => amount < threshold,
                    CompareOperator::Equals => amount == threshold,
                }
            }
            ConditionRule::UserRole { operator, value } => {
                let Some(role) = first_field(snapshot, &ROLE_FIELDS).and_then(Value::as_str)
                else {
                    return false;
                };
                match operator {
                    RoleOperator::Equals => role == value,
                    RoleOperator::In => list_contains(value, role),
                }
            }
            ConditionRule::Custom { expression } => {
                match compile(expression, self.options.expression)
                    .and_then(|compiled| compiled.matches(snapshot))
                {
                    Ok(matched) => matched,
                    Err(err) => {
                        log_expression_failure(expression, &err);
                        false
                    }
                }
            }
        }
    }
}

/// Evaluates with default options.
pub fn evaluate_condition(condition: &Condition, snapshot: &Value) -> bool {
    ConditionEvaluator::default().evaluate(condition, snapshot)
}

fn log_expression_failure(expression: &str, err: &ExpressionError) {
    tracing::debug!(expression, error = %err, "custom condition did not evaluate");
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn field_matches(field: &Value, operator: FieldOperator, expected: &str) -> bool {
    match operator {
        FieldOperator::Equals => scalar_text(field).is_some_and(|actual| actual == expected),
        FieldOperator::NotEquals => scalar_text(field).is_some_and(|actual| actual != expected),
        FieldOperator::Contains => !field.is_null() && value_to_string(field).contains(expected),
        FieldOperator::In => {
            scalar_text(field).is_some_and(|actual| list_contains(expected, &actual))
        }
    }
}

fn risk_matches(actual: &str, operator: CompareOperator, expected: &str) -> bool {
    if operator == CompareOperator::Equals {
        return actual == expected;
    }
    let (Some(actual), Some(expected)) = (RiskLevel::parse(actual), RiskLevel::parse(expected))
    else {
        return false;
    };
    match operator {
        CompareOperator::GreaterThan => actual.rank() > expected.rank(),
        CompareOperator::LessThan => actual.rank() < expected.rank(),
        CompareOperator::Equals => actual == expected,
    }
}

fn parse_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    amount.is_finite().then_some(amount)
}

/// Membership in a comma separated list; items are trimmed.
fn list_contains(list: &str, needle: &str) -> bool {
    list.split(',').map(str::trim).any(|item| item == needle)
}
