use serde::Serialize;
use uuid::Uuid;

use crate::workflows::parallel::GroupStatus;
use crate::workflows::router::RoutingDecision;
use crate::workflows::types::ExecutionStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    InstanceStarted {
        approval_request_id: Uuid,
        workflow_id: Uuid,
        first_step_id: Option<Uuid>,
        executions_created: usize,
    },
    StepRouted {
        approval_request_id: Uuid,
        from_step_id: Uuid,
        decision: RoutingDecision,
    },
    ExecutionUpdated {
        execution_id: Uuid,
        approval_request_id: Uuid,
        parallel_group: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    /// A parallel group stopped being pending.
    GroupResolved {
        approval_request_id: Uuid,
        parallel_group: String,
        status: GroupStatus,
    },
    DefinitionChanged {
        workflow_id: Uuid,
    },
}
