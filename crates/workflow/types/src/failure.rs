//! Failures: typed, serializable errors that travel through history
//!
//! A [`Failure`] is what workflow logic and activities raise, and what the
//! engine records when something goes wrong. Failures nest: an activity
//! failure wraps the application error that caused it, and a child workflow
//! failure wraps whatever failed inside the child. The nesting is preserved
//! all the way to the client so the full cause chain can be inspected.

use crate::{ActivityType, Payload, RunId, WorkflowId, WorkflowType};
use serde::{Deserialize, Serialize};

/// Which timeout elapsed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    /// A single activity attempt ran longer than its start-to-close timeout
    StartToClose,
    /// An activity did not finish (across all attempts) before its deadline
    ScheduleToClose,
    /// The whole workflow execution exceeded its execution timeout
    WorkflowExecution,
}

/// Why the dispatcher stopped retrying an activity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    NonRetryableFailure,
    MaximumAttemptsReached,
    Timeout,
    Cancelled,
}

/// Classification of a failure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by user code
    Application {
        error_type: String,
        non_retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Payload>,
    },
    /// A timeout elapsed
    Timeout { timeout_type: TimeoutType },
    /// An activity invocation failed permanently; the cause says why
    Activity {
        activity_type: ActivityType,
        seq: u64,
        attempt: u32,
        retry_state: RetryState,
    },
    /// A child workflow failed to start or completed unsuccessfully
    ChildWorkflow {
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    /// A start request collided with a running execution
    AlreadyStarted {
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
    },
    Cancelled,
    Terminated,
}

/// A failure with an optional cause
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    /// A retryable application failure
    pub fn application(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application {
                error_type: error_type.into(),
                non_retryable: false,
                details: None,
            },
            cause: None,
        }
    }

    /// An application failure that must never be retried
    pub fn non_retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application {
                error_type: error_type.into(),
                non_retryable: true,
                details: None,
            },
            cause: None,
        }
    }

    pub fn timeout(timeout_type: TimeoutType) -> Self {
        let message = match timeout_type {
            TimeoutType::StartToClose => "activity attempt exceeded start-to-close timeout",
            TimeoutType::ScheduleToClose => "activity exceeded schedule-to-close timeout",
            TimeoutType::WorkflowExecution => "workflow exceeded execution timeout",
        };
        Self {
            message: message.to_string(),
            kind: FailureKind::Timeout { timeout_type },
            cause: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Cancelled,
            cause: None,
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            kind: FailureKind::Terminated,
            cause: None,
        }
    }

    pub fn already_started(workflow_type: WorkflowType, workflow_id: WorkflowId) -> Self {
        Self {
            message: format!("workflow execution already started: {}", workflow_id),
            kind: FailureKind::AlreadyStarted {
                workflow_type,
                workflow_id,
            },
            cause: None,
        }
    }

    /// Wrap the final failure of an activity invocation
    pub fn activity(
        activity_type: ActivityType,
        seq: u64,
        attempt: u32,
        retry_state: RetryState,
        cause: Failure,
    ) -> Self {
        Self {
            message: format!("activity '{}' failed", activity_type),
            kind: FailureKind::Activity {
                activity_type,
                seq,
                attempt,
                retry_state,
            },
            cause: Some(Box::new(cause)),
        }
    }

    /// Wrap a failure observed by a parent on one of its children
    pub fn child_workflow(
        workflow_type: WorkflowType,
        workflow_id: WorkflowId,
        run_id: Option<RunId>,
        cause: Failure,
    ) -> Self {
        Self {
            message: format!("child workflow '{}' failed", workflow_id),
            kind: FailureKind::ChildWorkflow {
                workflow_type,
                workflow_id,
                run_id,
            },
            cause: Some(Box::new(cause)),
        }
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        if let FailureKind::Application { details: slot, .. } = &mut self.kind {
            *slot = Some(details);
        }
        self
    }

    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// The direct cause, if any
    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// The innermost failure of the chain
    pub fn root_cause(&self) -> &Failure {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// Iterate over this failure and all of its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |f| f.cause())
    }

    pub fn error_type(&self) -> Option<&str> {
        match &self.kind {
            FailureKind::Application { error_type, .. } => Some(error_type),
            _ => None,
        }
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Application {
                non_retryable: true,
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, FailureKind::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout { .. })
    }

    pub fn is_activity(&self) -> bool {
        matches!(self.kind, FailureKind::Activity { .. })
    }

    pub fn is_child_workflow(&self) -> bool {
        matches!(self.kind, FailureKind::ChildWorkflow { .. })
    }

    pub fn is_already_started(&self) -> bool {
        matches!(self.kind, FailureKind::AlreadyStarted { .. })
    }

    fn label(&self) -> &'static str {
        match self.kind {
            FailureKind::Application { .. } => "application",
            FailureKind::Timeout { .. } => "timeout",
            FailureKind::Activity { .. } => "activity",
            FailureKind::ChildWorkflow { .. } => "child workflow",
            FailureKind::AlreadyStarted { .. } => "already started",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Application { error_type, .. } => {
                write!(f, "{} ({}): {}", self.label(), error_type, self.message)
            }
            _ => write!(f, "{}: {}", self.label(), self.message),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn nested() -> Failure {
        let app = Failure::non_retryable("myException", "my exception");
        let activity = Failure::activity(
            ActivityType::new("getGreeting"),
            1,
            1,
            RetryState::NonRetryableFailure,
            app,
        );
        Failure::child_workflow(
            WorkflowType::new("GreetingChild"),
            WorkflowId::new("parent-child-1"),
            None,
            activity,
        )
    }

    #[test]
    fn cause_chain_is_preserved() {
        let failure = nested();
        let kinds: Vec<_> = failure.chain().map(|f| f.label()).collect();
        assert_eq!(kinds, vec!["child workflow", "activity", "application"]);
        assert!(failure.root_cause().is_non_retryable());
        assert_eq!(failure.root_cause().error_type(), Some("myException"));
    }

    #[test]
    fn std_error_source_walks_causes() {
        let failure = nested();
        let activity = failure.source().unwrap();
        let app = activity.source().unwrap();
        assert!(app.to_string().contains("my exception"));
        assert!(app.source().is_none());
    }

    #[test]
    fn serde_roundtrip_keeps_nesting() {
        let failure = nested();
        let json = serde_json::to_string(&failure).unwrap();
        let back: Failure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn details_only_attach_to_application_failures() {
        let app = Failure::application("Oops", "x").with_details(serde_json::json!({"k": 1}));
        assert!(matches!(
            app.kind,
            FailureKind::Application {
                details: Some(_),
                ..
            }
        ));

        let timeout = Failure::timeout(TimeoutType::StartToClose).with_details(serde_json::json!(1));
        assert!(timeout.is_timeout());
    }
}
