//! Execution history: the append-only event log replay is driven from
//!
//! Events fall into three groups:
//!
//! - **Command events** record a decision taken by the workflow logic
//!   (`ActivityTaskScheduled`, `TimerStarted`, `StartChildWorkflowInitiated`,
//!   `MarkerRecorded`, and the terminal completions the logic chose).
//! - **Input events** deliver something to the logic (activity results,
//!   timer fires, child progress, signals, cancellation requests).
//! - **Boundaries**: `WorkflowTaskStarted` marks the point a workflow task
//!   saw history up to; inputs recorded after it belong to the next task.
//!   `WorkflowTaskCompleted` closes the task, and the command events that
//!   follow it are the decisions of that task. `WorkflowTaskFailed` ends a
//!   task that produced no decisions.

use crate::{
    ActivityOptions, ActivityType, ChildWorkflowOptions, Failure, ParentInfo, Payload, RunId,
    TaskQueueName, WorkflowId, WorkflowStatus, WorkflowType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single recorded event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// 1-based position in the history
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// What happened
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowExecutionStarted {
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
        task_queue: TaskQueueName,
        input: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_timeout: Option<Duration>,
    },
    WorkflowTaskStarted,
    WorkflowTaskCompleted {
        /// Logical time observed by the logic during this task
        task_time: DateTime<Utc>,
    },
    WorkflowTaskFailed {
        failure: Failure,
    },

    // ── Activities ──
    ActivityTaskScheduled {
        seq: u64,
        activity_type: ActivityType,
        input: Payload,
        options: ActivityOptions,
    },
    ActivityTaskCompleted {
        seq: u64,
        result: Payload,
        attempt: u32,
    },
    ActivityTaskFailed {
        seq: u64,
        failure: Failure,
        attempt: u32,
    },

    // ── Timers ──
    TimerStarted {
        seq: u64,
        duration: Duration,
    },
    TimerFired {
        seq: u64,
    },

    // ── Child workflows ──
    StartChildWorkflowInitiated {
        seq: u64,
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
        input: Payload,
        options: ChildWorkflowOptions,
    },
    ChildWorkflowStarted {
        seq: u64,
        run_id: RunId,
    },
    StartChildWorkflowFailed {
        seq: u64,
        failure: Failure,
    },
    ChildWorkflowCompleted {
        seq: u64,
        result: Payload,
    },
    ChildWorkflowFailed {
        seq: u64,
        failure: Failure,
    },

    // ── Markers, signals, cancellation ──
    MarkerRecorded {
        name: String,
        value: Payload,
    },
    SignalReceived {
        name: String,
        payload: Payload,
    },
    CancelRequested {
        reason: String,
    },

    // ── Terminal ──
    WorkflowExecutionCompleted {
        result: Payload,
    },
    WorkflowExecutionFailed {
        failure: Failure,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionCancelled {
        failure: Failure,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
}

impl EventKind {
    /// Short name used in logs and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            Self::WorkflowTaskStarted => "WorkflowTaskStarted",
            Self::WorkflowTaskCompleted { .. } => "WorkflowTaskCompleted",
            Self::WorkflowTaskFailed { .. } => "WorkflowTaskFailed",
            Self::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            Self::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            Self::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::StartChildWorkflowInitiated { .. } => "StartChildWorkflowInitiated",
            Self::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            Self::StartChildWorkflowFailed { .. } => "StartChildWorkflowFailed",
            Self::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            Self::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            Self::MarkerRecorded { .. } => "MarkerRecorded",
            Self::SignalReceived { .. } => "SignalReceived",
            Self::CancelRequested { .. } => "CancelRequested",
            Self::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            Self::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            Self::WorkflowExecutionTimedOut => "WorkflowExecutionTimedOut",
            Self::WorkflowExecutionCancelled { .. } => "WorkflowExecutionCancelled",
            Self::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
        }
    }

    /// Recorded from a decision of the workflow logic
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskScheduled { .. }
                | Self::TimerStarted { .. }
                | Self::StartChildWorkflowInitiated { .. }
                | Self::MarkerRecorded { .. }
                | Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionCancelled { .. }
        )
    }

    /// Delivered to the workflow logic as a result or notification
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskCompleted { .. }
                | Self::ActivityTaskFailed { .. }
                | Self::TimerFired { .. }
                | Self::ChildWorkflowStarted { .. }
                | Self::StartChildWorkflowFailed { .. }
                | Self::ChildWorkflowCompleted { .. }
                | Self::ChildWorkflowFailed { .. }
                | Self::SignalReceived { .. }
                | Self::CancelRequested { .. }
        )
    }

    pub fn is_task_boundary(&self) -> bool {
        matches!(
            self,
            Self::WorkflowTaskStarted | Self::WorkflowTaskCompleted { .. } | Self::WorkflowTaskFailed { .. }
        )
    }

    /// The status an execution closes with, for terminal events
    pub fn terminal_status(&self) -> Option<WorkflowStatus> {
        match self {
            Self::WorkflowExecutionCompleted { .. } => Some(WorkflowStatus::Completed),
            Self::WorkflowExecutionFailed { .. } => Some(WorkflowStatus::Failed),
            Self::WorkflowExecutionTimedOut => Some(WorkflowStatus::TimedOut),
            Self::WorkflowExecutionCancelled { .. } => Some(WorkflowStatus::Cancelled),
            Self::WorkflowExecutionTerminated { .. } => Some(WorkflowStatus::Terminated),
            _ => None,
        }
    }
}

// ── History ──────────────────────────────────────────────────────────

/// Ordered events of one execution
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    events: Vec<HistoryEvent>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted events, checking that ids are contiguous.
    pub fn from_events(events: Vec<HistoryEvent>) -> Result<Self, String> {
        for (index, event) in events.iter().enumerate() {
            let expected = index as u64 + 1;
            if event.event_id != expected {
                return Err(format!(
                    "event id {} found at position {}",
                    event.event_id, expected
                ));
            }
        }
        match events.first().map(|e| &e.kind) {
            None | Some(EventKind::WorkflowExecutionStarted { .. }) => Ok(Self { events }),
            Some(other) => Err(format!("history starts with {}", other.name())),
        }
    }

    /// Append an event stamped with the current wall-clock time
    pub fn append(&mut self, kind: EventKind) -> &HistoryEvent {
        self.append_at(kind, Utc::now())
    }

    pub fn append_at(&mut self, kind: EventKind, timestamp: DateTime<Utc>) -> &HistoryEvent {
        let event_id = self.events.len() as u64 + 1;
        self.events.push(HistoryEvent {
            event_id,
            timestamp,
            kind,
        });
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Events appended after `event_id`
    pub fn events_after(&self, event_id: u64) -> &[HistoryEvent] {
        let start = (event_id as usize).min(self.events.len());
        &self.events[start..]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_event_id(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn started(&self) -> Option<&HistoryEvent> {
        self.events
            .first()
            .filter(|e| matches!(e.kind, EventKind::WorkflowExecutionStarted { .. }))
    }

    /// The terminal event, if the execution has closed
    pub fn terminal(&self) -> Option<&HistoryEvent> {
        self.events
            .last()
            .filter(|e| e.kind.terminal_status().is_some())
    }

    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }
}
