//! Commands: decisions produced by a workflow task

use crate::{ActivityOptions, ActivityType, ChildWorkflowOptions, EventKind, Failure, Payload, WorkflowId, WorkflowType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A decision taken by workflow logic during one workflow task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    ScheduleActivity {
        seq: u64,
        activity_type: ActivityType,
        input: Payload,
        options: ActivityOptions,
    },
    StartTimer {
        seq: u64,
        duration: Duration,
    },
    StartChildWorkflow {
        seq: u64,
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
        input: Payload,
        options: ChildWorkflowOptions,
    },
    RecordMarker {
        name: String,
        value: Payload,
    },
    CompleteWorkflow {
        result: Payload,
    },
    FailWorkflow {
        failure: Failure,
    },
    CancelWorkflow {
        failure: Failure,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "ScheduleActivity",
            Self::StartTimer { .. } => "StartTimer",
            Self::StartChildWorkflow { .. } => "StartChildWorkflow",
            Self::RecordMarker { .. } => "RecordMarker",
            Self::CompleteWorkflow { .. } => "CompleteWorkflow",
            Self::FailWorkflow { .. } => "FailWorkflow",
            Self::CancelWorkflow { .. } => "CancelWorkflow",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow { .. }
        )
    }

    /// The history event recording this command
    pub fn to_event(&self) -> EventKind {
        match self.clone() {
            Self::ScheduleActivity {
                seq,
                activity_type,
                input,
                options,
            } => EventKind::ActivityTaskScheduled {
                seq,
                activity_type,
                input,
                options,
            },
            Self::StartTimer { seq, duration } => EventKind::TimerStarted { seq, duration },
            Self::StartChildWorkflow {
                seq,
                workflow_type,
                workflow_id,
                input,
                options,
            } => EventKind::StartChildWorkflowInitiated {
                seq,
                workflow_type,
                workflow_id,
                input,
                options,
            },
            Self::RecordMarker { name, value } => EventKind::MarkerRecorded { name, value },
            Self::CompleteWorkflow { result } => EventKind::WorkflowExecutionCompleted { result },
            Self::FailWorkflow { failure } => EventKind::WorkflowExecutionFailed { failure },
            Self::CancelWorkflow { failure } => EventKind::WorkflowExecutionCancelled { failure },
        }
    }

    /// Whether a recorded command event is the same decision.
    ///
    /// Identity is compared (sequence number, type, id, marker name);
    /// inputs and results are not, so changing an argument is not a
    /// determinism violation but calling a different activity is.
    pub fn matches_event(&self, event: &EventKind) -> bool {
        match (self, event) {
            (
                Self::ScheduleActivity {
                    seq, activity_type, ..
                },
                EventKind::ActivityTaskScheduled {
                    seq: recorded_seq,
                    activity_type: recorded_type,
                    ..
                },
            ) => seq == recorded_seq && activity_type == recorded_type,
            (
                Self::StartTimer { seq, .. },
                EventKind::TimerStarted {
                    seq: recorded_seq, ..
                },
            ) => seq == recorded_seq,
            (
                Self::StartChildWorkflow {
                    seq,
                    workflow_type,
                    workflow_id,
                    ..
                },
                EventKind::StartChildWorkflowInitiated {
                    seq: recorded_seq,
                    workflow_type: recorded_type,
                    workflow_id: recorded_id,
                    ..
                },
            ) => seq == recorded_seq && workflow_type == recorded_type && workflow_id == recorded_id,
            (
                Self::RecordMarker { name, .. },
                EventKind::MarkerRecorded {
                    name: recorded_name,
                    ..
                },
            ) => name == recorded_name,
            (Self::CompleteWorkflow { .. }, EventKind::WorkflowExecutionCompleted { .. }) => true,
            (Self::FailWorkflow { .. }, EventKind::WorkflowExecutionFailed { .. }) => true,
            (Self::CancelWorkflow { .. }, EventKind::WorkflowExecutionCancelled { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(seq: u64, activity: &str) -> Command {
        Command::ScheduleActivity {
            seq,
            activity_type: ActivityType::new(activity),
            input: serde_json::json!(["Hello", "World"]),
            options: ActivityOptions::with_start_to_close(Duration::from_secs(2)),
        }
    }

    #[test]
    fn command_matches_its_own_event() {
        let command = schedule(1, "greet");
        assert!(command.matches_event(&command.to_event()));
    }

    #[test]
    fn different_activity_type_does_not_match() {
        let recorded = schedule(1, "greet").to_event();
        assert!(!schedule(1, "getGreeting").matches_event(&recorded));
        assert!(!schedule(2, "greet").matches_event(&recorded));
    }

    #[test]
    fn changed_input_still_matches() {
        let recorded = schedule(1, "greet").to_event();
        let changed = Command::ScheduleActivity {
            seq: 1,
            activity_type: ActivityType::new("greet"),
            input: serde_json::json!(["Hola", "Mundo"]),
            options: ActivityOptions::with_start_to_close(Duration::from_secs(5)),
        };
        assert!(changed.matches_event(&recorded));
    }

    #[test]
    fn timer_does_not_match_activity() {
        let timer = Command::StartTimer {
            seq: 1,
            duration: Duration::from_secs(2),
        };
        assert!(!timer.matches_event(&schedule(1, "greet").to_event()));
    }
}
