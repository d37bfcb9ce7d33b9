//! Task queue entries and delivery tokens

use crate::{ActivityInvocationId, ExecutionKey, TaskQueueName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The work a task queue entry stands for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Run the workflow logic of an execution against its history
    Workflow { key: ExecutionKey },
    /// Run one attempt of an activity invocation
    Activity {
        invocation: ActivityInvocationId,
        attempt: u32,
    },
}

impl TaskKind {
    pub fn is_workflow(&self) -> bool {
        matches!(self, Self::Workflow { .. })
    }
}

/// A pending unit of work on a named queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueEntry {
    pub entry_id: u64,
    pub queue: TaskQueueName,
    pub kind: TaskKind,
    /// Workflow or activity type name used for capability matching
    pub type_name: String,
    pub enqueued_at: DateTime<Utc>,
    /// How many times this entry has been handed to a worker
    pub delivery_count: u32,
}

/// Identifies one delivery of an entry; acknowledging needs the current one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskToken {
    pub entry_id: u64,
    pub delivery: u32,
}

impl std::fmt::Display for TaskToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}.{}", self.entry_id, self.delivery)
    }
}
