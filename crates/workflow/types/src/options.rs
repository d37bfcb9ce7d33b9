//! Workflow start options

use crate::{TaskQueueName, WorkflowId, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether a workflow id whose previous run has closed may be started again.
///
/// A running execution always blocks a new start, whatever the policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowIdReusePolicy {
    #[default]
    AllowDuplicate,
    /// Only when the previous run did not complete successfully
    AllowDuplicateFailedOnly,
    RejectDuplicate,
}

impl WorkflowIdReusePolicy {
    /// Whether a new run may follow a closed run with `previous` status.
    pub fn allows_reuse_after(&self, previous: WorkflowStatus) -> bool {
        match self {
            Self::AllowDuplicate => true,
            Self::AllowDuplicateFailedOnly => previous != WorkflowStatus::Completed,
            Self::RejectDuplicate => false,
        }
    }
}

/// Options for a client-initiated workflow start
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartWorkflowOptions {
    pub workflow_id: WorkflowId,
    pub task_queue: TaskQueueName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<Duration>,
    #[serde(default)]
    pub id_reuse_policy: WorkflowIdReusePolicy,
}

impl StartWorkflowOptions {
    pub fn new(workflow_id: impl Into<WorkflowId>, task_queue: impl Into<TaskQueueName>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: task_queue.into(),
            execution_timeout: None,
            id_reuse_policy: WorkflowIdReusePolicy::default(),
        }
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn id_reuse_policy(mut self, policy: WorkflowIdReusePolicy) -> Self {
        self.id_reuse_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_only_policy_rejects_after_success() {
        let policy = WorkflowIdReusePolicy::AllowDuplicateFailedOnly;
        assert!(!policy.allows_reuse_after(WorkflowStatus::Completed));
        assert!(policy.allows_reuse_after(WorkflowStatus::Failed));
        assert!(policy.allows_reuse_after(WorkflowStatus::TimedOut));
        assert!(!WorkflowIdReusePolicy::RejectDuplicate.allows_reuse_after(WorkflowStatus::Failed));
    }
}
