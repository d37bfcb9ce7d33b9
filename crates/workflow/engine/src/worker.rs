//! Workers: poll a task queue and execute workflow and activity tasks
//!
//! A worker only executes task types registered in its
//! [`ImplementationRegistry`]. Workflow tasks replay the execution's history
//! and report the new commands; activity tasks run one attempt under its
//! start-to-close timeout. Any number of workers may poll the same queue.

use crate::activity::ActivityContext;
use crate::registration::ImplementationRegistry;
use crate::replay::{non_determinism_failure, run_workflow_task};
use crate::service::WorkflowService;
use crate::task_queue::Capabilities;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use workflow_types::*;

/// Error type of the failure recorded when workflow logic panics
pub const WORKFLOW_PANIC_ERROR: &str = "WorkflowPanic";

/// Error type of the failure recorded when an activity attempt panics
pub const ACTIVITY_PANIC_ERROR: &str = "ActivityPanic";

/// Error type of the failure recorded when a workflow task cannot run
pub const WORKFLOW_TASK_ERROR: &str = "WorkflowTaskFailed";

#[derive(Clone)]
struct TaskProcessor {
    service: WorkflowService,
    task_queue: TaskQueueName,
    registry: Arc<ImplementationRegistry>,
}

impl TaskProcessor {
    async fn process(&self, entry: TaskQueueEntry, token: TaskToken) -> WorkflowResult<()> {
        match entry.kind {
            TaskKind::Workflow { key } => self.process_workflow_task(key, token).await,
            TaskKind::Activity { invocation, attempt } => {
                self.process_activity_task(invocation, attempt, token).await
            }
        }
    }

    async fn process_workflow_task(&self, key: ExecutionKey, token: TaskToken) -> WorkflowResult<()> {
        let task = match self.service.begin_workflow_task(&key).await {
            Ok(task) => task,
            Err(WorkflowError::NotRunning(_)) | Err(WorkflowError::RunNotFound(_)) => {
                tracing::debug!(execution = %key, "Workflow task for closed execution dropped");
                return self.ack(token);
            }
            Err(e) => return Err(e),
        };
        let definition = self.registry.workflow(&task.workflow_type)?;

        let run = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_workflow_task(
                definition.as_ref(),
                task.key.run_id.clone(),
                &task.history,
                task.task_time,
            )
        }));

        let reported = match run {
            Ok(Ok(outcome)) => {
                self.service
                    .complete_workflow_task(&task.key, task.task_id, outcome.commands)
                    .await
            }
            Ok(Err(error)) => {
                tracing::error!(execution = %task.key, error = %error, "Workflow task failed");
                let failure = match &error {
                    WorkflowError::NonDeterminism { .. } => non_determinism_failure(&error),
                    other => Failure::non_retryable(WORKFLOW_TASK_ERROR, other.to_string()),
                };
                self.service
                    .fail_workflow_task(&task.key, task.task_id, failure)
                    .await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(execution = %task.key, panic = %message, "Workflow logic panicked");
                self.service
                    .fail_workflow_task(
                        &task.key,
                        task.task_id,
                        Failure::non_retryable(WORKFLOW_PANIC_ERROR, message),
                    )
                    .await
            }
        };

        match reported {
            Err(WorkflowError::StaleTask(_)) | Err(WorkflowError::NotRunning(_)) => {
                tracing::debug!(execution = %task.key, "Workflow task result superseded");
            }
            other => other?,
        }
        self.ack(token)
    }

    async fn process_activity_task(
        &self,
        invocation: ActivityInvocationId,
        attempt: u32,
        token: TaskToken,
    ) -> WorkflowResult<()> {
        let (info, input, cancel) = match self.service.start_activity_task(&invocation, attempt).await {
            Ok(started) => started,
            Err(WorkflowError::StaleTask(reason)) => {
                tracing::debug!(invocation = %invocation, attempt, reason = %reason, "Activity task dropped");
                return self.ack(token);
            }
            Err(e) => return Err(e),
        };
        // From here the engine's start-to-close timer owns the attempt
        self.ack(token)?;

        let activity = self.registry.activity(&info.activity_type)?;
        let timeout = info.start_to_close_timeout;
        let ctx = ActivityContext::new(info, cancel);
        tracing::debug!(invocation = %invocation, attempt, "Activity attempt running");

        let mut handle = tokio::spawn(async move { activity.execute(ctx, input).await });
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                tracing::error!(invocation = %invocation, attempt, error = %join_error, "Activity attempt panicked");
                Err(Failure::application(ACTIVITY_PANIC_ERROR, join_error.to_string()))
            }
            Err(_) => {
                handle.abort();
                tracing::warn!(invocation = %invocation, attempt, "Activity attempt abandoned after timeout");
                return Ok(());
            }
        };

        self.service
            .complete_activity_task(&invocation, attempt, outcome)
            .await
    }

    fn ack(&self, token: TaskToken) -> WorkflowResult<()> {
        match self.service.task_queues().ack(token) {
            Err(WorkflowError::StaleTask(reason)) => {
                tracing::debug!(token = %token, reason = %reason, "Acknowledged a redelivered task");
                Ok(())
            }
            other => other,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "workflow logic panicked".to_string()
    }
}

async fn poll_loop(
    processor: TaskProcessor,
    capabilities: Capabilities,
    mut shutdown: watch::Receiver<bool>,
    poll_timeout: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = processor.service.task_queues().poll(&processor.task_queue, &capabilities, poll_timeout) => polled,
        };
        if let Some((entry, token)) = polled {
            let entry_id = entry.entry_id;
            if let Err(e) = processor.process(entry, token).await {
                tracing::warn!(entry_id, error = %e, "Task processing failed");
            }
        }
    }
}

/// Polls one task queue with a fixed set of implementations
pub struct Worker {
    processor: TaskProcessor,
    shutdown: watch::Sender<bool>,
    pollers: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        service: WorkflowService,
        task_queue: impl Into<TaskQueueName>,
        registry: ImplementationRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            processor: TaskProcessor {
                service,
                task_queue: task_queue.into(),
                registry: Arc::new(registry),
            },
            shutdown,
            pollers: Vec::new(),
        }
    }

    pub fn task_queue(&self) -> &TaskQueueName {
        &self.processor.task_queue
    }

    /// Spawn the pollers; workflow and activity tasks get separate pools
    pub fn start(&mut self) {
        if !self.pollers.is_empty() {
            return;
        }
        let config = self.processor.service.config().worker.clone();
        let capabilities = self.processor.registry.capabilities();
        let poll_timeout = config.poll_timeout();

        let pools = [
            (
                capabilities.workflows_only(),
                self.processor.registry.workflow_count(),
                config.max_concurrent_workflow_tasks,
            ),
            (
                capabilities.activities_only(),
                self.processor.registry.activity_count(),
                config.max_concurrent_activity_tasks,
            ),
        ];
        for (caps, registered, pollers) in pools {
            if registered == 0 {
                continue;
            }
            for _ in 0..pollers.max(1) {
                self.pollers.push(tokio::spawn(poll_loop(
                    self.processor.clone(),
                    caps.clone(),
                    self.shutdown.subscribe(),
                    poll_timeout,
                )));
            }
        }
        tracing::info!(
            task_queue = %self.processor.task_queue,
            pollers = self.pollers.len(),
            workflows = self.processor.registry.workflow_count(),
            activities = self.processor.registry.activity_count(),
            "Worker started"
        );
    }

    /// Execute at most one task, waiting up to `timeout` for it.
    /// Returns whether a task was processed.
    pub async fn run_once(&self, timeout: Duration) -> WorkflowResult<bool> {
        let capabilities = self.processor.registry.capabilities();
        let polled = self
            .processor
            .service
            .task_queues()
            .poll(&self.processor.task_queue, &capabilities, timeout)
            .await;
        match polled {
            Some((entry, token)) => {
                self.processor.process(entry, token).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop polling and wait for in-progress tasks to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for poller in self.pollers.drain(..) {
            if let Err(e) = poller.await {
                tracing::warn!(error = %e, "Poller ended abnormally");
            }
        }
        tracing::info!(task_queue = %self.processor.task_queue, "Worker stopped");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("task_queue", &self.processor.task_queue)
            .field("registry", &self.processor.registry)
            .field("pollers", &self.pollers.len())
            .finish()
    }
}
