//! Workflow service: the async front of the execution engine
//!
//! The service wraps the synchronous [`ExecutionEngine`] in a mutex and
//! carries out the effects it returns: tasks go onto the task queues,
//! timers are armed on the timer service, and closures wake anyone waiting
//! for a result. Clients start and control executions through it; workers
//! poll its task queues and report back through it.

use crate::activity::ActivityInfo;
use crate::config::EngineConfig;
use crate::observability::{EventBus, ExecutionEvent};
use crate::orchestrator::{ActivityTaskStart, Effect, ExecutionEngine, WorkflowTask};
use crate::store::HistoryStore;
use crate::task_queue::TaskQueues;
use crate::timer::{TimerId, TimerService};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use workflow_types::*;

struct ServiceInner {
    engine: Mutex<ExecutionEngine>,
    queues: TaskQueues,
    timers: TimerService,
    events: EventBus,
    config: EngineConfig,
    /// Bumped every time an execution closes
    closures: watch::Sender<u64>,
    /// Cancellation switches of executions with running activities
    cancellations: std::sync::Mutex<HashMap<ExecutionKey, watch::Sender<bool>>>,
}

/// Handle to a running workflow service. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowService {
    inner: Arc<ServiceInner>,
}

impl WorkflowService {
    /// Create a service with the store named in `config`, recovering any
    /// executions it already holds. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig) -> WorkflowResult<Self> {
        let store = config.store.open()?;
        Self::with_store(config, store)
    }

    /// Create a service on an explicit store, recovering its executions
    pub fn with_store(config: EngineConfig, store: Arc<dyn HistoryStore>) -> WorkflowResult<Self> {
        let events = EventBus::new(config.events.capacity);
        let (engine, effects) = ExecutionEngine::recover(&config, events.clone(), store)?;
        let (timers, fired) = TimerService::new();
        let (closures, _) = watch::channel(0);

        let service = Self {
            inner: Arc::new(ServiceInner {
                engine: Mutex::new(engine),
                queues: TaskQueues::new(config.task_queue.visibility_timeout()),
                timers,
                events,
                config,
                closures,
                cancellations: std::sync::Mutex::new(HashMap::new()),
            }),
        };
        tokio::spawn(timer_loop(Arc::downgrade(&service.inner), fired));
        service.apply_effects(effects);
        tracing::info!("Workflow service started");
        Ok(service)
    }

    // ── Client API ───────────────────────────────────────────────────

    /// Start a workflow execution.
    ///
    /// Fails with `AlreadyStarted` if `options.workflow_id` has a running
    /// execution on `options.task_queue`.
    pub async fn start_workflow(
        &self,
        workflow_type: impl Into<WorkflowType>,
        input: Payload,
        options: StartWorkflowOptions,
    ) -> WorkflowResult<WorkflowHandle> {
        let workflow_type = workflow_type.into();
        let key = self
            .inner
            .commit(|engine| engine.start_execution(workflow_type, input, options, None))
            .await?;
        Ok(WorkflowHandle {
            service: self.clone(),
            key,
        })
    }

    /// Handle to the current (or most recent) run of `workflow_id`
    pub async fn handle(&self, workflow_id: &WorkflowId) -> WorkflowResult<WorkflowHandle> {
        let key = self.inner.engine.lock().await.lookup(workflow_id)?;
        Ok(WorkflowHandle {
            service: self.clone(),
            key,
        })
    }

    /// Wait for the result of the current (or most recent) run of `workflow_id`
    pub async fn get_result(&self, workflow_id: &WorkflowId) -> WorkflowResult<Payload> {
        self.handle(workflow_id).await?.result().await
    }

    pub async fn signal_workflow(&self, workflow_id: &WorkflowId, name: &str, payload: Payload) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.signal(workflow_id, name, payload)?)))
            .await
    }

    pub async fn cancel_workflow(&self, workflow_id: &WorkflowId, reason: &str) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.request_cancel(workflow_id, reason)?)))
            .await
    }

    pub async fn terminate_workflow(&self, workflow_id: &WorkflowId, reason: &str) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.terminate(workflow_id, reason)?)))
            .await
    }

    pub async fn describe(&self, workflow_id: &WorkflowId) -> WorkflowResult<ExecutionInfo> {
        let engine = self.inner.engine.lock().await;
        let key = engine.lookup(workflow_id)?;
        engine.describe(&key)
    }

    pub async fn history(&self, workflow_id: &WorkflowId) -> WorkflowResult<History> {
        let engine = self.inner.engine.lock().await;
        let key = engine.lookup(workflow_id)?;
        engine.history(&key)
    }

    /// Lifecycle events of every execution from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    async fn wait_for_outcome(&self, key: &ExecutionKey) -> WorkflowResult<Result<Payload, Failure>> {
        let mut closures = self.inner.closures.subscribe();
        loop {
            closures.borrow_and_update();
            if let Some(outcome) = self.inner.engine.lock().await.outcome(key)? {
                return Ok(outcome);
            }
            closures.changed().await.map_err(|_| WorkflowError::Shutdown)?;
        }
    }

    // ── Worker API ───────────────────────────────────────────────────

    pub fn task_queues(&self) -> &TaskQueues {
        &self.inner.queues
    }

    pub async fn begin_workflow_task(&self, key: &ExecutionKey) -> WorkflowResult<WorkflowTask> {
        self.inner
            .commit(|engine| Ok((engine.begin_workflow_task(key)?, Vec::new())))
            .await
    }

    pub async fn complete_workflow_task(
        &self,
        key: &ExecutionKey,
        task_id: u64,
        commands: Vec<Command>,
    ) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.complete_workflow_task(key, task_id, commands)?)))
            .await
    }

    pub async fn fail_workflow_task(&self, key: &ExecutionKey, task_id: u64, failure: Failure) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.fail_workflow_task(key, task_id, failure)?)))
            .await
    }

    /// Claim an activity attempt. Returns its details and a cancellation
    /// switch that flips when cancellation of the owning execution is
    /// requested or the execution closes.
    pub async fn start_activity_task(
        &self,
        invocation: &ActivityInvocationId,
        attempt: u32,
    ) -> WorkflowResult<(ActivityInfo, Payload, watch::Receiver<bool>)> {
        let (start, effects) = self
            .inner
            .engine
            .lock()
            .await
            .start_activity_task(invocation, attempt)?;
        self.apply_effects(effects);

        let cancel = self.cancellation_for(&invocation.execution);
        let ActivityTaskStart {
            invocation,
            activity_type,
            workflow_type,
            task_queue,
            attempt,
            input,
            start_to_close_timeout,
            scheduled_at,
            started_at,
        } = start;
        let info = ActivityInfo {
            invocation,
            activity_type,
            workflow_type,
            task_queue,
            attempt,
            start_to_close_timeout,
            scheduled_at,
            started_at,
        };
        Ok((info, input, cancel))
    }

    pub async fn complete_activity_task(
        &self,
        invocation: &ActivityInvocationId,
        attempt: u32,
        outcome: Result<Payload, Failure>,
    ) -> WorkflowResult<()> {
        self.inner
            .commit(|engine| Ok(((), engine.complete_activity_task(invocation, attempt, outcome)?)))
            .await
    }

    fn cancellation_for(&self, key: &ExecutionKey) -> watch::Receiver<bool> {
        let mut cancellations = self
            .inner
            .cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cancellations
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    // ── Effects ──────────────────────────────────────────────────────

    fn apply_effects(&self, effects: Vec<Effect>) {
        self.inner.apply_effects(effects);
    }
}

impl ServiceInner {
    /// Run an engine operation, write what it recorded and carry out its
    /// effects.
    ///
    /// Effects are applied even when the write fails: the operation already
    /// took hold in memory, and its events go out with the next write. The
    /// write error is still returned to the caller.
    async fn commit<T>(
        &self,
        operation: impl FnOnce(&mut ExecutionEngine) -> WorkflowResult<(T, Vec<Effect>)>,
    ) -> WorkflowResult<T> {
        let (value, effects, written) = {
            let mut engine = self.engine.lock().await;
            let (value, effects) = operation(&mut *engine)?;
            (value, effects, engine.persist())
        };
        self.apply_effects(effects);
        written.map(|()| value)
    }

    fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::EnqueueWorkflowTask {
                    queue,
                    key,
                    workflow_type,
                } => {
                    self.queues
                        .push(&queue, TaskKind::Workflow { key }, workflow_type.as_str());
                }
                Effect::EnqueueActivityTask {
                    queue,
                    invocation,
                    activity_type,
                    attempt,
                } => {
                    self.queues.push(
                        &queue,
                        TaskKind::Activity { invocation, attempt },
                        activity_type.as_str(),
                    );
                }
                Effect::StartTimer { id, after } => self.timers.schedule(id, after),
                Effect::CancelTimer { id } => self.timers.cancel(&id),
                Effect::CancelActivities { key } => {
                    let switch = self
                        .cancellations
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(&key);
                    if let Some(switch) = switch {
                        let _ = switch.send(true);
                    }
                }
                Effect::Closed { key, status } => {
                    tracing::debug!(execution = %key, status = %status, "Waking result waiters");
                    if let Ok(mut cancellations) = self.cancellations.lock() {
                        cancellations.remove(&key);
                    }
                    self.timers.cancel_execution(&key);
                    self.closures.send_modify(|n| *n += 1);
                }
            }
        }
    }
}

async fn timer_loop(inner: Weak<ServiceInner>, mut fired: mpsc::UnboundedReceiver<TimerId>) {
    while let Some(id) = fired.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let fired = id.clone();
        if let Err(e) = inner
            .commit(|engine| Ok(((), engine.fire_timer(fired)?)))
            .await
        {
            tracing::error!(timer = %id, error = %e, "Timer handling failed");
        }
    }
    tracing::debug!("Timer loop stopped");
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService")
            .field("queues", &self.inner.queues)
            .finish_non_exhaustive()
    }
}

// ── Handles ──────────────────────────────────────────────────────────

/// Client handle to one workflow execution
#[derive(Clone, Debug)]
pub struct WorkflowHandle {
    service: WorkflowService,
    key: ExecutionKey,
}

impl WorkflowHandle {
    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.key.workflow_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.key.run_id
    }

    /// Wait for the execution to close.
    ///
    /// Anything but completion comes back as `ExecutionFailed` carrying the
    /// full failure chain.
    pub async fn result(&self) -> WorkflowResult<Payload> {
        self.service
            .wait_for_outcome(&self.key)
            .await?
            .map_err(|failure| WorkflowError::ExecutionFailed {
                key: self.key.clone(),
                failure,
            })
    }

    /// Wait for the result and decode it
    pub async fn result_as<T: DeserializeOwned>(&self) -> WorkflowResult<T> {
        let payload = self.result().await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn describe(&self) -> WorkflowResult<ExecutionInfo> {
        self.service.inner.engine.lock().await.describe(&self.key)
    }

    pub async fn history(&self) -> WorkflowResult<History> {
        self.service.inner.engine.lock().await.history(&self.key)
    }

    pub async fn signal(&self, name: &str, payload: Payload) -> WorkflowResult<()> {
        self.ensure_current().await?;
        self.service
            .signal_workflow(&self.key.workflow_id, name, payload)
            .await
    }

    pub async fn cancel(&self, reason: &str) -> WorkflowResult<()> {
        self.ensure_current().await?;
        self.service
            .cancel_workflow(&self.key.workflow_id, reason)
            .await
    }

    pub async fn terminate(&self, reason: &str) -> WorkflowResult<()> {
        self.ensure_current().await?;
        self.service
            .terminate_workflow(&self.key.workflow_id, reason)
            .await
    }

    /// Operations by id must not reach a newer run than this handle's
    async fn ensure_current(&self) -> WorkflowResult<()> {
        if self.service.inner.engine.lock().await.is_running(&self.key) {
            Ok(())
        } else {
            Err(WorkflowError::NotRunning(self.key.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHistoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn queue() -> TaskQueueName {
        TaskQueueName::new("HelloActivityTaskQueue")
    }

    /// Memory store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryHistoryStore,
        down: AtomicBool,
    }

    impl HistoryStore for FlakyStore {
        fn append(&self, run_id: &RunId, events: &[HistoryEvent]) -> WorkflowResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(WorkflowError::Storage("history volume unavailable".into()));
            }
            self.inner.append(run_id, events)
        }

        fn load(&self, run_id: &RunId) -> WorkflowResult<Vec<HistoryEvent>> {
            self.inner.load(run_id)
        }

        fn list_runs(&self) -> WorkflowResult<Vec<RunId>> {
            self.inner.list_runs()
        }
    }

    #[tokio::test]
    async fn test_start_enqueues_workflow_task() {
        let service = WorkflowService::new(EngineConfig::testing()).unwrap();
        let handle = service
            .start_workflow(
                "GreetingWorkflow",
                serde_json::json!("World"),
                StartWorkflowOptions::new("HelloActivityWorkflow", queue()),
            )
            .await
            .unwrap();
        assert_eq!(handle.workflow_id().as_str(), "HelloActivityWorkflow");
        assert_eq!(service.task_queues().pending_len(&queue()), 1);
        assert_eq!(handle.describe().await.unwrap().status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_result_waits_for_close() {
        let service = WorkflowService::new(EngineConfig::testing()).unwrap();
        let handle = service
            .start_workflow(
                "GreetingWorkflow",
                Payload::Null,
                StartWorkflowOptions::new("wf", queue()),
            )
            .await
            .unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.result().await })
        };
        let task = service.begin_workflow_task(handle.key()).await.unwrap();
        service
            .complete_workflow_task(
                handle.key(),
                task.task_id,
                vec![Command::CompleteWorkflow {
                    result: serde_json::json!("done"),
                }],
            )
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, serde_json::json!("done"));
    }

    #[tokio::test]
    async fn test_terminate_reports_failure() {
        let service = WorkflowService::new(EngineConfig::testing()).unwrap();
        let handle = service
            .start_workflow(
                "GreetingWorkflow",
                Payload::Null,
                StartWorkflowOptions::new("wf", queue()),
            )
            .await
            .unwrap();
        handle.terminate("operator").await.unwrap();

        let err = handle.result().await.unwrap_err();
        let failure = err.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Terminated);
        assert!(matches!(
            handle.signal("signal_complete", Payload::Null).await,
            Err(WorkflowError::NotRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timer_fires_through_service() {
        let service = WorkflowService::new(EngineConfig::testing()).unwrap();
        let handle = service
            .start_workflow(
                "GreetingWorkflow",
                Payload::Null,
                StartWorkflowOptions::new("wf", queue()),
            )
            .await
            .unwrap();
        let task = service.begin_workflow_task(handle.key()).await.unwrap();
        service
            .complete_workflow_task(
                handle.key(),
                task.task_id,
                vec![Command::StartTimer {
                    seq: 1,
                    duration: Duration::from_secs(2),
                }],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let history = handle.history().await.unwrap();
        assert!(history
            .events()
            .iter()
            .any(|e| e.kind == EventKind::TimerFired { seq: 1 }));
    }

    #[tokio::test]
    async fn test_failed_write_still_applies_effects() {
        let store = Arc::new(FlakyStore::default());
        let service = WorkflowService::with_store(EngineConfig::testing(), store.clone()).unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = service
            .start_workflow("GreetingWorkflow", Payload::Null, StartWorkflowOptions::new("wf", queue()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(_)));
        assert_eq!(service.task_queues().pending_len(&queue()), 1);
        assert!(store.list_runs().unwrap().is_empty());

        store.down.store(false, Ordering::SeqCst);
        let handle = service.handle(&WorkflowId::new("wf")).await.unwrap();
        let task = service.begin_workflow_task(handle.key()).await.unwrap();
        let stored = store.load(handle.run_id()).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(matches!(stored[0].kind, EventKind::WorkflowExecutionStarted { .. }));

        // a closure whose write fails still wakes result waiters
        store.down.store(true, Ordering::SeqCst);
        let err = service
            .complete_workflow_task(
                handle.key(),
                task.task_id,
                vec![Command::CompleteWorkflow {
                    result: serde_json::json!("done"),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(_)));
        let result = tokio::time::timeout(Duration::from_secs(5), handle.result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, serde_json::json!("done"));

        // the next successful write carries the events left behind
        store.down.store(false, Ordering::SeqCst);
        service
            .start_workflow("GreetingWorkflow", Payload::Null, StartWorkflowOptions::new("wf-2", queue()))
            .await
            .unwrap();
        assert!(store
            .load(handle.run_id())
            .unwrap()
            .iter()
            .any(|e| matches!(e.kind, EventKind::WorkflowExecutionCompleted { .. })));
    }
}
