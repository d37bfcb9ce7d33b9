//! Child workflow options

use crate::{TaskQueueName, WorkflowId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a still-running child when its parent closes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentClosePolicy {
    /// The child is terminated
    #[default]
    Terminate,
    /// Cancellation is requested; the child decides how to unwind
    RequestCancel,
    /// The child keeps running on its own
    Abandon,
}

/// Options for starting a child workflow
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Explicit business id; derived from the parent id and call sequence when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    /// Task queue of the child; the parent's queue when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<TaskQueueName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<Duration>,
    #[serde(default)]
    pub parent_close_policy: ParentClosePolicy,
}

impl ChildWorkflowOptions {
    pub fn with_id(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    pub fn task_queue(mut self, queue: impl Into<TaskQueueName>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn parent_close_policy(mut self, policy: ParentClosePolicy) -> Self {
        self.parent_close_policy = policy;
        self
    }
}

/// Id given to a child started without an explicit one
pub fn derived_child_id(parent: &WorkflowId, seq: u64) -> WorkflowId {
    WorkflowId::new(format!("{}-child-{}", parent, seq))
}
