//! Activities: non-deterministic work executed by workers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use workflow_types::{ActivityInvocationId, ActivityType, Failure, Payload, TaskQueueName, WorkflowType};

/// An activity implementation.
///
/// Attempts may run more than once for the same invocation; make the
/// external effect idempotent or raise a non-retryable failure.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    async fn execute(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, Failure>;
}

/// Adapter turning an async function into an [`Activity`]
pub struct ActivityFn<F> {
    func: F,
}

impl<F> ActivityFn<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Failure>> + Send + 'static,
    {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Activity for ActivityFn<F>
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, Failure>> + Send + 'static,
{
    async fn execute(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, Failure> {
        (self.func)(ctx, input).await
    }
}

/// Details of the attempt being executed
#[derive(Clone, Debug)]
pub struct ActivityInfo {
    pub invocation: ActivityInvocationId,
    pub activity_type: ActivityType,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub attempt: u32,
    pub start_to_close_timeout: Duration,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// Handed to every activity attempt
#[derive(Clone, Debug)]
pub struct ActivityContext {
    info: ActivityInfo,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub fn new(info: ActivityInfo, cancel: watch::Receiver<bool>) -> Self {
        Self { info, cancel }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    pub fn attempt(&self) -> u32 {
        self.info.attempt
    }

    /// Whether the owning execution asked running activities to stop
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested; never resolves otherwise
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
