pub mod conditions;
pub mod engine;
pub mod expressions;
pub mod loader;
pub mod parallel;
pub mod paths;
pub mod router;
pub mod types;
pub mod validation;

pub use conditions::{evaluate_condition, AmountParsing, ConditionEvaluator, EvaluatorOptions};
pub use engine::{GroupSummary, ImportedWorkflow, InstanceStart, InstanceStatus, WorkflowEngine};
pub use expressions::{compile, CompiledExpression, EvaluationOptions, ExpressionError};
pub use loader::{BundleLoader, WorkflowBundle};
pub use parallel::{
    group_status, plan_parallel_groups, GroupStatus, ParallelPlan, RejectionPolicy,
};
pub use router::{RoutingDecision, SequentialRouter};
pub use types::{
    CompareOperator, Condition, ConditionPatch, ConditionRule, ExecutionStatus, ExecutionType,
    ExecutionUpdate, FieldOperator, NewCondition, NewStep, NewWorkflow, ParallelExecution,
    RoleOperator, StepDefinition, StepPatch, WorkflowDefinition, WorkflowGraph, WorkflowPatch,
};
pub use validation::{graph_issues, GraphIssue};
