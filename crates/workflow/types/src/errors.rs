//! Error types for the workflow executor

use crate::{ActivityType, ExecutionKey, Failure, RunId, TaskQueueName, WorkflowId, WorkflowType};

/// Errors that can occur in workflow operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow execution already started: {workflow_id} ({workflow_type}) on queue {task_queue}")]
    AlreadyStarted {
        workflow_id: WorkflowId,
        workflow_type: WorkflowType,
        task_queue: TaskQueueName,
    },

    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(WorkflowId),

    #[error("Workflow run not found: {0}")]
    RunNotFound(RunId),

    #[error("Workflow execution {key} failed: {failure}")]
    ExecutionFailed {
        key: ExecutionKey,
        #[source]
        failure: Failure,
    },

    #[error("Workflow execution not running: {0}")]
    NotRunning(ExecutionKey),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Non-deterministic workflow {key}: {message}")]
    NonDeterminism { key: ExecutionKey, message: String },

    #[error("History corrupted: {0}")]
    HistoryCorrupted(String),

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(WorkflowType),

    #[error("Unknown activity type: {0}")]
    UnknownActivityType(ActivityType),

    #[error("Stale task: {0}")]
    StaleTask(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service shut down")]
    Shutdown,
}

impl WorkflowError {
    /// The failure carried by an `ExecutionFailed` error
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::ExecutionFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn execution_failed_exposes_cause_chain() {
        let cause = Failure::non_retryable("myException", "my exception");
        let failure = Failure::application("Outer", "outer").with_cause(cause);
        let err = WorkflowError::ExecutionFailed {
            key: ExecutionKey::new(WorkflowId::new("w"), RunId::new("r")),
            failure,
        };
        let source = err.source().unwrap();
        assert!(source.source().unwrap().to_string().contains("my exception"));
        assert!(err.failure().is_some());
    }
}
