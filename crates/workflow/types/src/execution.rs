//! Workflow executions: one run of a workflow id
//!
//! A [`WorkflowExecution`] owns its [`History`]. Status is derived from that
//! history and moves monotonically from `Running` to exactly one terminal
//! status; nothing leaves a terminal status.

use crate::{
    EventKind, ExecutionKey, Failure, History, HistoryEvent, Payload, TaskQueueName, TimeoutType,
    WorkflowError, WorkflowResult, WorkflowType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Status ───────────────────────────────────────────────────────────

/// The lifecycle status of a workflow execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    /// Cancellation was requested and the logic accepted it
    Cancelled,
    /// Closed forcibly without running the logic
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Reference from a child execution back to the parent that started it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub key: ExecutionKey,
    pub workflow_type: WorkflowType,
    /// Sequence number of the start-child call inside the parent
    pub seq: u64,
}

// ── Execution ────────────────────────────────────────────────────────

/// One run of a workflow
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub key: ExecutionKey,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub input: Payload,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<Duration>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub history: History,
}

impl WorkflowExecution {
    /// Create a running execution and record its `WorkflowExecutionStarted` event
    pub fn start(
        key: ExecutionKey,
        workflow_type: WorkflowType,
        task_queue: TaskQueueName,
        input: Payload,
        parent: Option<ParentInfo>,
        execution_timeout: Option<Duration>,
    ) -> Self {
        let mut history = History::new();
        let started_at = history
            .append(EventKind::WorkflowExecutionStarted {
                workflow_type: workflow_type.clone(),
                workflow_id: key.workflow_id.clone(),
                task_queue: task_queue.clone(),
                input: input.clone(),
                parent: parent.clone(),
                execution_timeout,
            })
            .timestamp;
        Self {
            key,
            workflow_type,
            task_queue,
            input,
            status: WorkflowStatus::Running,
            result: None,
            failure: None,
            parent,
            execution_timeout,
            cancel_requested: false,
            started_at,
            closed_at: None,
            history,
        }
    }

    /// Rebuild an execution from a persisted history
    pub fn from_history(run_id: crate::RunId, history: History) -> WorkflowResult<Self> {
        let started = history
            .started()
            .ok_or_else(|| WorkflowError::HistoryCorrupted("missing start event".into()))?;
        let EventKind::WorkflowExecutionStarted {
            workflow_type,
            workflow_id,
            task_queue,
            input,
            parent,
            execution_timeout,
        } = started.kind.clone()
        else {
            return Err(WorkflowError::HistoryCorrupted("missing start event".into()));
        };

        let mut execution = Self {
            key: ExecutionKey::new(workflow_id, run_id),
            workflow_type,
            task_queue,
            input,
            status: WorkflowStatus::Running,
            result: None,
            failure: None,
            parent,
            execution_timeout,
            cancel_requested: false,
            started_at: started.timestamp,
            closed_at: None,
            history: History::new(),
        };
        execution.cancel_requested = history
            .events()
            .iter()
            .any(|e| matches!(e.kind, EventKind::CancelRequested { .. }));
        if let Some(terminal) = history.terminal() {
            execution.apply_close(&terminal.kind, terminal.timestamp)?;
        }
        execution.history = history;
        Ok(execution)
    }

    // ── State transitions ────────────────────────────────────────────

    /// Append a non-terminal event
    pub fn record(&mut self, kind: EventKind) -> WorkflowResult<&HistoryEvent> {
        if self.status.is_terminal() {
            return Err(WorkflowError::NotRunning(self.key.clone()));
        }
        if kind.terminal_status().is_some() {
            return self.close(kind);
        }
        if matches!(kind, EventKind::CancelRequested { .. }) {
            self.cancel_requested = true;
        }
        Ok(self.history.append(kind))
    }

    /// Append a terminal event and move to its status
    pub fn close(&mut self, kind: EventKind) -> WorkflowResult<&HistoryEvent> {
        let now = Utc::now();
        self.apply_close(&kind, now)?;
        Ok(self.history.append_at(kind, now))
    }

    fn apply_close(&mut self, kind: &EventKind, at: DateTime<Utc>) -> WorkflowResult<()> {
        let to = kind.terminal_status().ok_or_else(|| {
            WorkflowError::InvalidTransition(format!("{} is not a terminal event", kind.name()))
        })?;
        if self.status.is_terminal() {
            return Err(WorkflowError::InvalidTransition(format!(
                "{}: {} -> {}",
                self.key, self.status, to
            )));
        }
        match kind {
            EventKind::WorkflowExecutionCompleted { result } => self.result = Some(result.clone()),
            EventKind::WorkflowExecutionFailed { failure }
            | EventKind::WorkflowExecutionCancelled { failure } => {
                self.failure = Some(failure.clone())
            }
            EventKind::WorkflowExecutionTimedOut => {
                self.failure = Some(Failure::timeout(TimeoutType::WorkflowExecution))
            }
            EventKind::WorkflowExecutionTerminated { reason } => {
                self.failure = Some(Failure::terminated(reason.clone()))
            }
            _ => {}
        }
        self.status = to;
        self.closed_at = Some(at);
        Ok(())
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    /// Result or failure, once the execution has closed
    pub fn outcome(&self) -> Option<Result<Payload, Failure>> {
        match self.status {
            WorkflowStatus::Running => None,
            WorkflowStatus::Completed => Some(Ok(self.result.clone().unwrap_or(Payload::Null))),
            _ => Some(Err(self
                .failure
                .clone()
                .unwrap_or_else(|| Failure::terminated("closed without a recorded failure")))),
        }
    }

    pub fn info(&self) -> ExecutionInfo {
        ExecutionInfo {
            key: self.key.clone(),
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            status: self.status,
            parent: self.parent.as_ref().map(|p| p.key.clone()),
            cancel_requested: self.cancel_requested,
            started_at: self.started_at,
            closed_at: self.closed_at,
            history_length: self.history.len(),
            failure: self.failure.clone(),
        }
    }
}

/// Snapshot of an execution without its history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub key: ExecutionKey,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub status: WorkflowStatus,
    pub parent: Option<ExecutionKey>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub history_length: usize,
    pub failure: Option<Failure>,
}
