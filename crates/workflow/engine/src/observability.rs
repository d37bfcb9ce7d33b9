//! Observability: structured execution events and tracing setup
//!
//! Every lifecycle change of an execution or activity attempt is published
//! as an [`ExecutionEvent`] on a broadcast channel and logged through
//! `tracing`. Subscribers (metrics exporters, test harnesses) receive the
//! start and close timestamps and failure causes without touching engine
//! state.

use crate::config::LoggingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_types::{
    ActivityInvocationId, ActivityType, ExecutionKey, Failure, TaskQueueName, WorkflowStatus,
    WorkflowType,
};

/// A structured lifecycle event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStarted {
        key: ExecutionKey,
        workflow_type: WorkflowType,
        task_queue: TaskQueueName,
        parent: Option<ExecutionKey>,
        at: DateTime<Utc>,
    },
    WorkflowClosed {
        key: ExecutionKey,
        workflow_type: WorkflowType,
        status: WorkflowStatus,
        started_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
        failure: Option<Failure>,
    },
    WorkflowTaskFailed {
        key: ExecutionKey,
        failure: Failure,
        at: DateTime<Utc>,
    },
    ActivityAttemptStarted {
        id: ActivityInvocationId,
        activity_type: ActivityType,
        attempt: u32,
        at: DateTime<Utc>,
    },
    ActivityAttemptFailed {
        id: ActivityInvocationId,
        activity_type: ActivityType,
        attempt: u32,
        failure: Failure,
        will_retry: bool,
        at: DateTime<Utc>,
    },
    ActivityCompleted {
        id: ActivityInvocationId,
        activity_type: ActivityType,
        attempt: u32,
        at: DateTime<Utc>,
    },
    SignalReceived {
        key: ExecutionKey,
        name: String,
        at: DateTime<Utc>,
    },
    CancelRequested {
        key: ExecutionKey,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// The execution the event belongs to
    pub fn execution(&self) -> &ExecutionKey {
        match self {
            Self::WorkflowStarted { key, .. }
            | Self::WorkflowClosed { key, .. }
            | Self::WorkflowTaskFailed { key, .. }
            | Self::SignalReceived { key, .. }
            | Self::CancelRequested { key, .. } => key,
            Self::ActivityAttemptStarted { id, .. }
            | Self::ActivityAttemptFailed { id, .. }
            | Self::ActivityCompleted { id, .. } => &id.execution,
        }
    }

    fn log(&self) {
        match self {
            Self::WorkflowStarted {
                key,
                workflow_type,
                task_queue,
                ..
            } => tracing::info!(
                execution = %key,
                workflow_type = %workflow_type,
                task_queue = %task_queue,
                "Workflow execution started"
            ),
            Self::WorkflowClosed {
                key,
                status,
                failure,
                started_at,
                closed_at,
                ..
            } => {
                let elapsed_ms = (*closed_at - *started_at).num_milliseconds();
                match failure {
                    Some(failure) => tracing::info!(
                        execution = %key,
                        status = %status,
                        elapsed_ms,
                        failure = %failure,
                        "Workflow execution closed"
                    ),
                    None => tracing::info!(
                        execution = %key,
                        status = %status,
                        elapsed_ms,
                        "Workflow execution closed"
                    ),
                }
            }
            Self::WorkflowTaskFailed { key, failure, .. } => tracing::error!(
                execution = %key,
                failure = %failure,
                "Workflow task failed"
            ),
            Self::ActivityAttemptStarted {
                id,
                activity_type,
                attempt,
                ..
            } => tracing::debug!(
                invocation = %id,
                activity_type = %activity_type,
                attempt,
                "Activity attempt started"
            ),
            Self::ActivityAttemptFailed {
                id,
                activity_type,
                attempt,
                failure,
                will_retry,
                ..
            } => tracing::warn!(
                invocation = %id,
                activity_type = %activity_type,
                attempt,
                will_retry,
                failure = %failure,
                "Activity attempt failed"
            ),
            Self::ActivityCompleted {
                id,
                activity_type,
                attempt,
                ..
            } => tracing::debug!(
                invocation = %id,
                activity_type = %activity_type,
                attempt,
                "Activity completed"
            ),
            Self::SignalReceived { key, name, .. } => {
                tracing::debug!(execution = %key, signal = %name, "Signal received")
            }
            Self::CancelRequested { key, reason, .. } => {
                tracing::info!(execution = %key, reason = %reason, "Cancellation requested")
            }
        }
    }
}

// ── Event Bus ────────────────────────────────────────────────────────

/// Broadcasts execution events to any number of subscribers
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Log and broadcast an event. Having no subscribers is fine.
    pub fn publish(&self, event: ExecutionEvent) {
        event.log();
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this
/// twice is harmless; the second call leaves the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{RunId, WorkflowId};

    fn make_key() -> ExecutionKey {
        ExecutionKey::new(WorkflowId::new("wf"), RunId::generate())
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let key = make_key();
        bus.publish(ExecutionEvent::SignalReceived {
            key: key.clone(),
            name: "signal_complete".into(),
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution(), &key);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(ExecutionEvent::CancelRequested {
            key: make_key(),
            reason: "test".into(),
            at: Utc::now(),
        });
    }

    #[test]
    fn test_init_tracing_twice() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
