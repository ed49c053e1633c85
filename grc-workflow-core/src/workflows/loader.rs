use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::types::{ConditionRule, ExecutionType};
use crate::error::{Error, Result};

/// A workflow with its steps and conditions, referenced by step name, as
/// written in an import file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowBundle {
    pub workflow: BundleWorkflow,
    #[serde(default)]
    pub steps: Vec<BundleStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleWorkflow {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub execution_type: ExecutionType,
    /// Name of the step where parallel branches rejoin.
    #[serde(default)]
    pub convergence_step: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleStep {
    pub name: String,
    /// Defaults to the step's position in the file, starting at 1.
    #[serde(default)]
    pub step_order: Option<i32>,
    pub assignee_role: String,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Defaults to whether `parallel_group` is set.
    #[serde(default)]
    pub is_parallel: Option<bool>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub parallel_order: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<BundleCondition>,
}

impl BundleStep {
    pub fn effective_order(&self, position: usize) -> i32 {
        self.step_order.unwrap_or(position as i32 + 1)
    }

    pub fn effective_parallel(&self) -> bool {
        self.is_parallel.unwrap_or(self.parallel_group.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleCondition {
    pub name: String,
    pub rule: ConditionRule,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

pub struct BundleLoader;

impl BundleLoader {
    fn parse_value(path: &Path, raw: &str) -> Result<serde_json::Value> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or_default();

        if matches!(ext, "yaml" | "yml") {
            let yaml_value = serde_yaml::from_str::<serde_yaml::Value>(raw).map_err(|err| {
                Error::Config(format!(
                    "failed parsing workflow bundle yaml '{}': {err}",
                    path.display()
                ))
            })?;
            serde_json::to_value(yaml_value).map_err(|err| {
                Error::Config(format!(
                    "failed converting workflow bundle yaml '{}' to json: {err}",
                    path.display()
                ))
            })
        } else {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|err| {
                Error::Config(format!(
                    "failed parsing workflow bundle json '{}': {err}",
                    path.display()
                ))
            })
        }
    }

    /// Parses bundle text; the format follows the extension of `path`
    /// (`.yaml`/`.yml`, anything else is JSON).
    pub fn parse_str(path: &Path, raw: &str) -> Result<WorkflowBundle> {
        let value = Self::parse_value(path, raw)?;
        let bundle = serde_json::from_value::<WorkflowBundle>(value).map_err(|err| {
            Error::Config(format!(
                "failed parsing workflow bundle '{}': {err}",
                path.display()
            ))
        })?;
        Self::validate(&bundle)?;
        Ok(bundle)
    }

    pub fn parse_file(path: &Path) -> Result<WorkflowBundle> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!(
                "failed reading workflow bundle '{}': {err}",
                path.display()
            ))
        })?;
        Self::parse_str(path, &raw)
    }

    /// Name-level checks. Graph checks run after import, on the stored
    /// records.
    pub fn validate(bundle: &WorkflowBundle) -> Result<()> {
        let workflow = &bundle.workflow;
        if workflow.name.trim().is_empty() {
            return Err(Error::Validation(
                "workflow bundle must define a non-empty name".to_owned(),
            ));
        }
        if bundle.steps.is_empty() {
            return Err(Error::Validation(format!(
                "workflow '{}' must define at least one step",
                workflow.name
            )));
        }

        let mut names = HashSet::new();
        for step in &bundle.steps {
            let name = step.name.trim();
            if name.is_empty() {
                return Err(Error::Validation(format!(
                    "workflow '{}' has a step without a name",
                    workflow.name
                )));
            }
            if !names.insert(name) {
                return Err(Error::Validation(format!(
                    "workflow '{}' defines step '{name}' more than once",
                    workflow.name
                )));
            }
        }

        if let Some(convergence) = &workflow.convergence_step {
            if !names.contains(convergence.trim()) {
                return Err(Error::Validation(format!(
                    "workflow '{}' convergence_step '{convergence}' is not a step",
                    workflow.name
                )));
            }
        }

        for step in &bundle.steps {
            for condition in &step.conditions {
                if let Some(target) = &condition.next_step {
                    if !names.contains(target.trim()) {
                        return Err(Error::Validation(format!(
                            "condition '{}' on step '{}' targets unknown step '{target}'",
                            condition.name, step.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::types::CompareOperator;

    const YAML: &str = r#"
workflow:
  name: Vendor risk intake
  entity_type: risk
  execution_type: hybrid
  convergence_step: Sign-off
steps:
  - name: Triage
    assignee_role: risk_analyst
    conditions:
      - name: Large contract
        rule: { type: amount_threshold, operator: greater_than, value: 10000 }
        next_step: Sign-off
  - name: Legal review
    assignee_role: legal
    parallel_group: reviews
    parallel_order: 1
  - name: Security review
    assignee_role: security
    parallel_group: reviews
    parallel_order: 2
  - name: Sign-off
    assignee_role: ciso
"#;

    #[test]
    fn parses_yaml_bundle() {
        let bundle = BundleLoader::parse_str(Path::new("vendor.yaml"), YAML).expect("bundle");
        assert_eq!(bundle.workflow.execution_type, ExecutionType::Hybrid);
        assert_eq!(bundle.steps.len(), 4);
        assert_eq!(bundle.steps[3].effective_order(3), 4);
        assert!(bundle.steps[1].effective_parallel());
        assert!(!bundle.steps[0].effective_parallel());
        assert_eq!(
            bundle.steps[0].conditions[0].rule,
            ConditionRule::AmountThreshold {
                operator: CompareOperator::GreaterThan,
                value: "10000".to_owned(),
            }
        );
    }

    #[test]
    fn parses_json_bundle() {
        let raw = r#"{
            "workflow": { "name": "Audit", "entity_type": "audit" },
            "steps": [{ "name": "Plan", "assignee_role": "auditor" }]
        }"#;
        let bundle = BundleLoader::parse_str(Path::new("audit.json"), raw).expect("bundle");
        assert_eq!(bundle.workflow.execution_type, ExecutionType::Sequential);
        assert!(bundle.workflow.is_active);
    }

    #[test]
    fn rejects_unknown_target() {
        let raw = YAML.replace("next_step: Sign-off", "next_step: Board");
        let err = BundleLoader::parse_str(Path::new("vendor.yml"), &raw).expect_err("invalid");
        assert!(err.to_string().contains("unknown step 'Board'"));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let raw = YAML.replace("name: Security review", "name: Legal review");
        let err = BundleLoader::parse_str(Path::new("vendor.yaml"), &raw).expect_err("invalid");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = YAML.replace("assignee_role: ciso", "assignee_role: ciso\n    timeout: 5");
        assert!(BundleLoader::parse_str(Path::new("vendor.yaml"), &raw).is_err());
    }
}
