//! Execution engine: the state machine behind every workflow execution
//!
//! The engine owns executions, the workflow registry and the activity
//! dispatcher. It:
//! 1. Starts executions and reserves their workflow ids
//! 2. Hands out workflow tasks and applies the commands they return
//! 3. Turns activity results, timer firings, signals and child completions
//!    into history events
//! 4. Closes executions and propagates the closure to parents and children
//!
//! **The engine never runs user code and never waits.** Every operation is
//! synchronous and returns [`Effect`]s (tasks to enqueue, timers to arm)
//! that the service carries out. Operations change state in memory only;
//! [`ExecutionEngine::persist`] writes the history events they recorded.

use crate::config::EngineConfig;
use crate::dispatcher::{ActivityDispatcher, AttemptResolution, ResolutionOutcome};
use crate::observability::{EventBus, ExecutionEvent};
use crate::registry::WorkflowRegistry;
use crate::store::HistoryStore;
use crate::timer::TimerId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use workflow_types::*;

/// Something the service must do on the engine's behalf
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    EnqueueWorkflowTask {
        queue: TaskQueueName,
        key: ExecutionKey,
        workflow_type: WorkflowType,
    },
    EnqueueActivityTask {
        queue: TaskQueueName,
        invocation: ActivityInvocationId,
        activity_type: ActivityType,
        attempt: u32,
    },
    StartTimer {
        id: TimerId,
        after: Duration,
    },
    /// `id` no longer matters and can be disarmed
    CancelTimer { id: TimerId },
    /// Running activity attempts of `key` should stop
    CancelActivities { key: ExecutionKey },
    /// `key` reached a terminal status
    Closed { key: ExecutionKey, status: WorkflowStatus },
}

/// A workflow task handed to a worker
#[derive(Clone, Debug)]
pub struct WorkflowTask {
    pub key: ExecutionKey,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub task_id: u64,
    pub task_time: DateTime<Utc>,
    pub history: Vec<HistoryEvent>,
}

/// Everything a worker needs to run one activity attempt
#[derive(Clone, Debug)]
pub struct ActivityTaskStart {
    pub invocation: ActivityInvocationId,
    pub activity_type: ActivityType,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub attempt: u32,
    pub input: Payload,
    pub start_to_close_timeout: Duration,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskState {
    /// No workflow task outstanding
    Idle,
    /// A workflow task is queued
    Pending,
    /// A worker is running the task
    InFlight { task_id: u64, task_time: DateTime<Utc> },
}

#[derive(Clone, Debug)]
struct ChildRef {
    key: ExecutionKey,
    policy: ParentClosePolicy,
}

#[derive(Clone, Debug)]
struct ExecutionState {
    execution: WorkflowExecution,
    task: TaskState,
    /// An input was recorded after the in-flight task started
    input_during_task: bool,
    children: BTreeMap<u64, ChildRef>,
    /// Number of history events already written to the store
    persisted: usize,
}

impl ExecutionState {
    fn new(execution: WorkflowExecution) -> Self {
        Self {
            execution,
            task: TaskState::Idle,
            input_during_task: false,
            children: BTreeMap::new(),
            persisted: 0,
        }
    }

    fn enqueue_task(&mut self, effects: &mut Vec<Effect>) {
        if self.task == TaskState::Idle {
            self.task = TaskState::Pending;
            effects.push(Effect::EnqueueWorkflowTask {
                queue: self.execution.task_queue.clone(),
                key: self.execution.key.clone(),
                workflow_type: self.execution.workflow_type.clone(),
            });
        }
    }
}

/// The execution engine: coordinates, never runs user code
pub struct ExecutionEngine {
    registry: WorkflowRegistry,
    dispatcher: ActivityDispatcher,
    executions: HashMap<ExecutionKey, ExecutionState>,
    events: EventBus,
    store: Arc<dyn HistoryStore>,
    /// Executions with history events not yet written to the store
    dirty: HashSet<ExecutionKey>,
    next_task_id: u64,
}

impl ExecutionEngine {
    pub fn new(config: &EngineConfig, events: EventBus, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            registry: WorkflowRegistry::new(),
            dispatcher: ActivityDispatcher::new(config.activity.retry_policy()),
            executions: HashMap::new(),
            events,
            store,
            dirty: HashSet::new(),
            next_task_id: 1,
        }
    }

    // ── Execution Lifecycle ──────────────────────────────────────────

    /// Start a new execution.
    ///
    /// Fails with `AlreadyStarted` when the workflow id is taken on the
    /// task queue; nothing is recorded in that case.
    pub fn start_execution(
        &mut self,
        workflow_type: WorkflowType,
        input: Payload,
        options: StartWorkflowOptions,
        parent: Option<ParentInfo>,
    ) -> WorkflowResult<(ExecutionKey, Vec<Effect>)> {
        let mut effects = Vec::new();
        let key = self.start_inner(workflow_type, input, options, parent, &mut effects)?;
        Ok((key, effects))
    }

    fn start_inner(
        &mut self,
        workflow_type: WorkflowType,
        input: Payload,
        options: StartWorkflowOptions,
        parent: Option<ParentInfo>,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<ExecutionKey> {
        let run_id = self.registry.reserve(
            &options.task_queue,
            &options.workflow_id,
            &workflow_type,
            options.id_reuse_policy,
        )?;
        let key = ExecutionKey::new(options.workflow_id.clone(), run_id);
        let execution = WorkflowExecution::start(
            key.clone(),
            workflow_type.clone(),
            options.task_queue.clone(),
            input,
            parent,
            options.execution_timeout,
        );

        if let Some(timeout) = options.execution_timeout {
            effects.push(Effect::StartTimer {
                id: TimerId::ExecutionTimeout { key: key.clone() },
                after: timeout,
            });
        }

        self.events.publish(ExecutionEvent::WorkflowStarted {
            key: key.clone(),
            workflow_type,
            task_queue: options.task_queue,
            parent: execution.parent.as_ref().map(|p| p.key.clone()),
            at: execution.started_at,
        });

        let mut state = ExecutionState::new(execution);
        state.enqueue_task(effects);
        self.executions.insert(key.clone(), state);
        self.dirty.insert(key.clone());
        Ok(key)
    }

    // ── Workflow Tasks ───────────────────────────────────────────────

    /// Hand the next workflow task of `key` to a worker.
    ///
    /// The task sees history up to a `WorkflowTaskStarted` event. A
    /// redelivered task replaces the one in flight; results reported for
    /// the replaced task are rejected as stale.
    pub fn begin_workflow_task(&mut self, key: &ExecutionKey) -> WorkflowResult<WorkflowTask> {
        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let state = Self::state_mut(&mut self.executions, key)?;
        if !state.execution.is_running() {
            return Err(WorkflowError::NotRunning(key.clone()));
        }
        state.execution.record(EventKind::WorkflowTaskStarted)?;
        let task_time = Utc::now();
        state.task = TaskState::InFlight { task_id, task_time };
        state.input_during_task = false;
        self.dirty.insert(key.clone());

        let task = WorkflowTask {
            key: key.clone(),
            workflow_type: state.execution.workflow_type.clone(),
            task_queue: state.execution.task_queue.clone(),
            task_id,
            task_time,
            history: state.execution.history.events().to_vec(),
        };
        tracing::debug!(execution = %key, task_id, events = task.history.len(), "Workflow task started");
        Ok(task)
    }

    /// Apply the commands produced by a workflow task
    pub fn complete_workflow_task(
        &mut self,
        key: &ExecutionKey,
        task_id: u64,
        commands: Vec<Command>,
    ) -> WorkflowResult<Vec<Effect>> {
        let mut effects = Vec::new();
        let task_time = self.take_task(key, task_id)?;
        Self::state_mut(&mut self.executions, key)?
            .execution
            .record(EventKind::WorkflowTaskCompleted { task_time })?;
        self.dirty.insert(key.clone());

        tracing::debug!(execution = %key, task_id, commands = commands.len(), "Workflow task completed");
        for command in commands {
            if !self.is_running(key) {
                tracing::warn!(execution = %key, command = command.name(), "Command after close ignored");
                continue;
            }
            self.apply_command(key, command, &mut effects)?;
        }

        let state = Self::state_mut(&mut self.executions, key)?;
        if state.execution.is_running() && std::mem::take(&mut state.input_during_task) {
            state.enqueue_task(&mut effects);
        }
        Ok(effects)
    }

    /// A workflow task could not produce commands; the execution fails.
    ///
    /// `WorkflowTaskFailed` precedes the terminal event so replay knows the
    /// failure was not a decision of the logic.
    pub fn fail_workflow_task(
        &mut self,
        key: &ExecutionKey,
        task_id: u64,
        failure: Failure,
    ) -> WorkflowResult<Vec<Effect>> {
        let mut effects = Vec::new();
        self.take_task(key, task_id)?;
        Self::state_mut(&mut self.executions, key)?
            .execution
            .record(EventKind::WorkflowTaskFailed {
                failure: failure.clone(),
            })?;
        self.events.publish(ExecutionEvent::WorkflowTaskFailed {
            key: key.clone(),
            failure: failure.clone(),
            at: Utc::now(),
        });
        self.close_execution(key, EventKind::WorkflowExecutionFailed { failure }, &mut effects)?;
        Ok(effects)
    }

    fn take_task(&mut self, key: &ExecutionKey, task_id: u64) -> WorkflowResult<DateTime<Utc>> {
        let state = Self::state_mut(&mut self.executions, key)?;
        if !state.execution.is_running() {
            return Err(WorkflowError::NotRunning(key.clone()));
        }
        match state.task {
            TaskState::InFlight {
                task_id: current,
                task_time,
            } if current == task_id => {
                state.task = TaskState::Idle;
                Ok(task_time)
            }
            _ => Err(WorkflowError::StaleTask(format!(
                "workflow task {} of {} is no longer current",
                task_id, key
            ))),
        }
    }

    fn apply_command(
        &mut self,
        key: &ExecutionKey,
        command: Command,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<()> {
        if command.is_terminal() {
            return self.close_execution(key, command.to_event(), effects);
        }

        let state = Self::state_mut(&mut self.executions, key)?;
        state.execution.record(command.to_event())?;
        let task_queue = state.execution.task_queue.clone();
        let parent_type = state.execution.workflow_type.clone();

        match command {
            Command::ScheduleActivity {
                seq,
                activity_type,
                input,
                options,
            } => {
                let id = ActivityInvocationId::new(key.clone(), seq);
                let deadline = options.schedule_to_close_timeout;
                let invocation = self
                    .dispatcher
                    .schedule(id.clone(), activity_type, input, options, &task_queue);
                effects.push(Effect::EnqueueActivityTask {
                    queue: invocation.task_queue.clone(),
                    invocation: id.clone(),
                    activity_type: invocation.activity_type.clone(),
                    attempt: invocation.attempt,
                });
                if let Some(deadline) = deadline {
                    effects.push(Effect::StartTimer {
                        id: TimerId::ActivityDeadline { invocation: id },
                        after: deadline,
                    });
                }
            }
            Command::StartTimer { seq, duration } => {
                effects.push(Effect::StartTimer {
                    id: TimerId::Workflow {
                        key: key.clone(),
                        seq,
                    },
                    after: duration,
                });
            }
            Command::StartChildWorkflow {
                seq,
                workflow_type,
                workflow_id,
                input,
                options,
            } => {
                let queue = options.task_queue.clone().unwrap_or(task_queue);
                let mut start = StartWorkflowOptions::new(workflow_id.clone(), queue);
                start.execution_timeout = options.execution_timeout;
                let parent = ParentInfo {
                    key: key.clone(),
                    workflow_type: parent_type,
                    seq,
                };
                match self.start_inner(workflow_type.clone(), input, start, Some(parent), effects) {
                    Ok(child) => {
                        let run_id = child.run_id.clone();
                        Self::state_mut(&mut self.executions, key)?.children.insert(
                            seq,
                            ChildRef {
                                key: child,
                                policy: options.parent_close_policy,
                            },
                        );
                        self.deliver_input(key, EventKind::ChildWorkflowStarted { seq, run_id }, effects)?;
                    }
                    Err(WorkflowError::AlreadyStarted { .. }) => {
                        tracing::info!(
                            execution = %key,
                            child_id = %workflow_id,
                            "Child workflow id already in use"
                        );
                        let cause = Failure::already_started(workflow_type.clone(), workflow_id.clone());
                        let failure = Failure::child_workflow(workflow_type, workflow_id, None, cause);
                        self.deliver_input(key, EventKind::StartChildWorkflowFailed { seq, failure }, effects)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Command::RecordMarker { .. } => {}
            Command::CompleteWorkflow { .. }
            | Command::FailWorkflow { .. }
            | Command::CancelWorkflow { .. } => {}
        }
        Ok(())
    }

    // ── Inputs ───────────────────────────────────────────────────────

    /// Record an input event and make sure a workflow task will see it.
    ///
    /// An input arriving while a task is in flight is recorded after that
    /// task's `WorkflowTaskStarted`; a new task follows once it completes.
    fn deliver_input(
        &mut self,
        key: &ExecutionKey,
        kind: EventKind,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<()> {
        let state = Self::state_mut(&mut self.executions, key)?;
        if !state.execution.is_running() {
            return Err(WorkflowError::NotRunning(key.clone()));
        }
        state.execution.record(kind)?;
        match state.task {
            TaskState::InFlight { .. } => state.input_during_task = true,
            TaskState::Pending => {}
            TaskState::Idle => state.enqueue_task(effects),
        }
        self.dirty.insert(key.clone());
        Ok(())
    }

    /// Deliver an input to an execution that may already have closed
    fn deliver_if_running(
        &mut self,
        key: &ExecutionKey,
        kind: EventKind,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<()> {
        match self.deliver_input(key, kind, effects) {
            Err(WorkflowError::NotRunning(_)) => {
                tracing::debug!(execution = %key, "Input for closed execution dropped");
                Ok(())
            }
            other => other,
        }
    }

    /// Deliver a signal to the running execution of `workflow_id`
    pub fn signal(
        &mut self,
        workflow_id: &WorkflowId,
        name: &str,
        payload: Payload,
    ) -> WorkflowResult<Vec<Effect>> {
        let key = self.running_key(workflow_id)?;
        let mut effects = Vec::new();
        self.deliver_input(
            &key,
            EventKind::SignalReceived {
                name: name.to_string(),
                payload,
            },
            &mut effects,
        )?;
        self.events.publish(ExecutionEvent::SignalReceived {
            key,
            name: name.to_string(),
            at: Utc::now(),
        });
        Ok(effects)
    }

    /// Ask the running execution of `workflow_id` to cancel.
    ///
    /// The logic observes the request and decides how to unwind; running
    /// activities of the execution are told to stop. Repeated requests are
    /// no-ops.
    pub fn request_cancel(&mut self, workflow_id: &WorkflowId, reason: &str) -> WorkflowResult<Vec<Effect>> {
        let key = self.running_key(workflow_id)?;
        let mut effects = Vec::new();
        self.request_cancel_inner(&key, reason, &mut effects)?;
        Ok(effects)
    }

    fn request_cancel_inner(
        &mut self,
        key: &ExecutionKey,
        reason: &str,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<()> {
        if Self::state_mut(&mut self.executions, key)?.execution.cancel_requested {
            return Ok(());
        }
        self.deliver_input(
            key,
            EventKind::CancelRequested {
                reason: reason.to_string(),
            },
            effects,
        )?;
        if !self.dispatcher.pending_for(key).is_empty() {
            effects.push(Effect::CancelActivities { key: key.clone() });
        }
        self.events.publish(ExecutionEvent::CancelRequested {
            key: key.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Close the running execution of `workflow_id` without running its logic
    pub fn terminate(&mut self, workflow_id: &WorkflowId, reason: &str) -> WorkflowResult<Vec<Effect>> {
        let key = self.running_key(workflow_id)?;
        let mut effects = Vec::new();
        self.close_execution(
            &key,
            EventKind::WorkflowExecutionTerminated {
                reason: reason.to_string(),
            },
            &mut effects,
        )?;
        Ok(effects)
    }

    // ── Activities ───────────────────────────────────────────────────

    /// Mark an activity attempt as started and arm its start-to-close timer
    pub fn start_activity_task(
        &mut self,
        id: &ActivityInvocationId,
        attempt: u32,
    ) -> WorkflowResult<(ActivityTaskStart, Vec<Effect>)> {
        let workflow_type = self
            .executions
            .get(&id.execution)
            .filter(|s| s.execution.is_running())
            .map(|s| s.execution.workflow_type.clone())
            .ok_or_else(|| WorkflowError::StaleTask(format!("activity {} belongs to a closed execution", id)))?;

        let invocation = self.dispatcher.start_attempt(id, attempt)?;
        let started_at = invocation.started_at.unwrap_or_else(Utc::now);
        let start = ActivityTaskStart {
            invocation: invocation.id.clone(),
            activity_type: invocation.activity_type.clone(),
            workflow_type,
            task_queue: invocation.task_queue.clone(),
            attempt,
            input: invocation.input.clone(),
            start_to_close_timeout: invocation.options.start_to_close_timeout,
            scheduled_at: invocation.scheduled_at,
            started_at,
        };

        self.events.publish(ExecutionEvent::ActivityAttemptStarted {
            id: id.clone(),
            activity_type: start.activity_type.clone(),
            attempt,
            at: started_at,
        });
        let effects = vec![Effect::StartTimer {
            id: TimerId::ActivityTimeout {
                invocation: id.clone(),
                attempt,
            },
            after: start.start_to_close_timeout,
        }];
        Ok((start, effects))
    }

    /// Record the result of an activity attempt. Stale results are ignored.
    pub fn complete_activity_task(
        &mut self,
        id: &ActivityInvocationId,
        attempt: u32,
        outcome: Result<Payload, Failure>,
    ) -> WorkflowResult<Vec<Effect>> {
        let mut effects = Vec::new();
        if let Some(resolution) = self.dispatcher.record_completion(id, attempt, outcome) {
            self.apply_resolution(resolution, &mut effects)?;
        }
        Ok(effects)
    }

    fn apply_resolution(&mut self, resolution: AttemptResolution, effects: &mut Vec<Effect>) -> WorkflowResult<()> {
        let AttemptResolution {
            invocation,
            activity_type,
            attempt,
            outcome,
        } = resolution;
        let key = invocation.execution.clone();
        let seq = invocation.seq;
        effects.push(Effect::CancelTimer {
            id: TimerId::ActivityTimeout {
                invocation: invocation.clone(),
                attempt,
            },
        });
        if !matches!(outcome, ResolutionOutcome::Retry { .. }) {
            effects.push(Effect::CancelTimer {
                id: TimerId::ActivityDeadline {
                    invocation: invocation.clone(),
                },
            });
        }

        match outcome {
            ResolutionOutcome::Completed(result) => {
                self.events.publish(ExecutionEvent::ActivityCompleted {
                    id: invocation,
                    activity_type,
                    attempt,
                    at: Utc::now(),
                });
                self.deliver_if_running(&key, EventKind::ActivityTaskCompleted { seq, result, attempt }, effects)
            }
            ResolutionOutcome::Retry {
                next_attempt,
                backoff,
                failure,
            } => {
                self.events.publish(ExecutionEvent::ActivityAttemptFailed {
                    id: invocation.clone(),
                    activity_type,
                    attempt,
                    failure,
                    will_retry: true,
                    at: Utc::now(),
                });
                effects.push(Effect::StartTimer {
                    id: TimerId::ActivityBackoff {
                        invocation,
                        attempt: next_attempt,
                    },
                    after: backoff,
                });
                Ok(())
            }
            ResolutionOutcome::Failed(failure) => {
                self.events.publish(ExecutionEvent::ActivityAttemptFailed {
                    id: invocation,
                    activity_type,
                    attempt,
                    failure: failure.clone(),
                    will_retry: false,
                    at: Utc::now(),
                });
                self.deliver_if_running(&key, EventKind::ActivityTaskFailed { seq, failure, attempt }, effects)
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// React to an elapsed timer. Firings that no longer matter are ignored.
    pub fn fire_timer(&mut self, id: TimerId) -> WorkflowResult<Vec<Effect>> {
        let mut effects = Vec::new();
        match id {
            TimerId::Workflow { key, seq } => {
                self.deliver_if_running(&key, EventKind::TimerFired { seq }, &mut effects)?;
            }
            TimerId::ActivityTimeout { invocation, attempt } => {
                if let Some(resolution) = self.dispatcher.record_timeout(&invocation, attempt) {
                    self.apply_resolution(resolution, &mut effects)?;
                }
            }
            TimerId::ActivityDeadline { invocation } => {
                if let Some(resolution) = self.dispatcher.record_deadline(&invocation) {
                    self.apply_resolution(resolution, &mut effects)?;
                }
            }
            TimerId::ActivityBackoff { invocation, attempt } => {
                if let Some(ready) = self.dispatcher.retry_ready(&invocation, attempt) {
                    tracing::debug!(invocation = %invocation, attempt, "Activity retry dispatched");
                    effects.push(Effect::EnqueueActivityTask {
                        queue: ready.task_queue.clone(),
                        invocation: ready.id.clone(),
                        activity_type: ready.activity_type.clone(),
                        attempt,
                    });
                }
            }
            TimerId::ExecutionTimeout { key } => {
                if self.is_running(&key) {
                    self.close_execution(&key, EventKind::WorkflowExecutionTimedOut, &mut effects)?;
                }
            }
        }
        Ok(effects)
    }

    // ── Closing ──────────────────────────────────────────────────────

    fn close_execution(
        &mut self,
        key: &ExecutionKey,
        kind: EventKind,
        effects: &mut Vec<Effect>,
    ) -> WorkflowResult<()> {
        let state = Self::state_mut(&mut self.executions, key)?;
        state.execution.close(kind)?;
        state.task = TaskState::Idle;
        state.input_during_task = false;
        let children = std::mem::take(&mut state.children);
        let execution = &state.execution;
        let status = execution.status;
        let parent = execution.parent.clone();
        let outcome = execution.outcome();
        self.events.publish(ExecutionEvent::WorkflowClosed {
            key: key.clone(),
            workflow_type: execution.workflow_type.clone(),
            status,
            started_at: execution.started_at,
            closed_at: execution.closed_at.unwrap_or_else(Utc::now),
            failure: execution.failure.clone(),
        });
        let workflow_type = execution.workflow_type.clone();
        self.dirty.insert(key.clone());

        self.registry.close(key, status)?;
        if !self.dispatcher.remove_for_execution(key).is_empty() {
            effects.push(Effect::CancelActivities { key: key.clone() });
        }

        for child in children.into_values() {
            if !self.is_running(&child.key) {
                continue;
            }
            let reason = format!("parent {} closed", key);
            match child.policy {
                ParentClosePolicy::Terminate => self.close_execution(
                    &child.key,
                    EventKind::WorkflowExecutionTerminated { reason },
                    effects,
                )?,
                ParentClosePolicy::RequestCancel => self.request_cancel_inner(&child.key, &reason, effects)?,
                ParentClosePolicy::Abandon => {
                    tracing::debug!(child = %child.key, "Child abandoned by closing parent");
                }
            }
        }

        if let (Some(parent), Some(outcome)) = (parent, outcome) {
            let kind = child_outcome_event(parent.seq, workflow_type, key, outcome);
            self.deliver_if_running(&parent.key, kind, effects)?;
        }

        effects.push(Effect::Closed {
            key: key.clone(),
            status,
        });
        Ok(())
    }

    // ── Query Methods ────────────────────────────────────────────────

    /// The running run of `workflow_id`, otherwise its most recent run
    pub fn lookup(&self, workflow_id: &WorkflowId) -> WorkflowResult<ExecutionKey> {
        Ok(self.registry.lookup(workflow_id)?.key.clone())
    }

    pub fn describe(&self, key: &ExecutionKey) -> WorkflowResult<ExecutionInfo> {
        Ok(self.state(key)?.execution.info())
    }

    pub fn history(&self, key: &ExecutionKey) -> WorkflowResult<History> {
        Ok(self.state(key)?.execution.history.clone())
    }

    /// Result or failure of `key`, once closed
    pub fn outcome(&self, key: &ExecutionKey) -> WorkflowResult<Option<Result<Payload, Failure>>> {
        Ok(self.state(key)?.execution.outcome())
    }

    pub fn is_running(&self, key: &ExecutionKey) -> bool {
        self.executions
            .get(key)
            .map(|s| s.execution.is_running())
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.registry.running_count()
    }

    pub fn pending_activity_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    fn running_key(&self, workflow_id: &WorkflowId) -> WorkflowResult<ExecutionKey> {
        let found = self.registry.lookup(workflow_id)?;
        if !found.is_running() {
            return Err(WorkflowError::NotRunning(found.key.clone()));
        }
        Ok(found.key.clone())
    }

    fn state(&self, key: &ExecutionKey) -> WorkflowResult<&ExecutionState> {
        self.executions
            .get(key)
            .ok_or_else(|| WorkflowError::RunNotFound(key.run_id.clone()))
    }

    fn state_mut<'a>(
        executions: &'a mut HashMap<ExecutionKey, ExecutionState>,
        key: &ExecutionKey,
    ) -> WorkflowResult<&'a mut ExecutionState> {
        executions
            .get_mut(key)
            .ok_or_else(|| WorkflowError::RunNotFound(key.run_id.clone()))
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Write history events not yet in the store.
    ///
    /// Only executions touched since the last write are visited. A failed
    /// write does not hold back other executions; its events stay queued and
    /// go out with the next call. Returns the first error.
    pub fn persist(&mut self) -> WorkflowResult<()> {
        let mut failed = None;
        for key in std::mem::take(&mut self.dirty) {
            let Some(state) = self.executions.get_mut(&key) else {
                continue;
            };
            let events = state.execution.history.events();
            if state.persisted >= events.len() {
                continue;
            }
            match self.store.append(&key.run_id, &events[state.persisted..]) {
                Ok(()) => state.persisted = events.len(),
                Err(e) => {
                    tracing::error!(execution = %key, error = %e, "History write failed");
                    self.dirty.insert(key);
                    failed.get_or_insert(e);
                }
            }
        }
        failed.map_or(Ok(()), Err)
    }

    /// Whether history events are waiting to be written
    pub fn has_unpersisted(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Rebuild the engine from every history in `store`.
    ///
    /// Running executions get a fresh workflow task; unfired timers and
    /// unfinished activities are re-armed, activities restarting at attempt 1.
    /// A closed child whose outcome its running parent never recorded is
    /// delivered to the parent again.
    pub fn recover(
        config: &EngineConfig,
        events: EventBus,
        store: Arc<dyn HistoryStore>,
    ) -> WorkflowResult<(Self, Vec<Effect>)> {
        let mut engine = Self::new(config, events, store.clone());
        let mut executions = Vec::new();
        for run_id in store.list_runs()? {
            let history = History::from_events(store.load(&run_id)?).map_err(WorkflowError::HistoryCorrupted)?;
            executions.push(WorkflowExecution::from_history(run_id, history)?);
        }
        executions.sort_by_key(|e| e.started_at);

        let mut effects = Vec::new();
        let now = Utc::now();
        for execution in executions {
            engine.registry.restore(
                execution.key.clone(),
                execution.workflow_type.clone(),
                execution.task_queue.clone(),
                execution.status,
            );
            let key = execution.key.clone();
            let mut state = ExecutionState::new(execution);
            state.persisted = state.execution.history.len();
            state.children = recorded_children(&state.execution.history);
            if state.execution.is_running() {
                engine.rearm(&state.execution, now, &mut effects);
                state.enqueue_task(&mut effects);
            }
            engine.executions.insert(key, state);
        }

        for (parent, kind) in engine.undelivered_child_outcomes() {
            tracing::info!(execution = %parent, event = kind.name(), "Child outcome recorded during recovery");
            engine.deliver_input(&parent, kind, &mut effects)?;
        }
        if let Err(e) = engine.persist() {
            tracing::warn!(error = %e, "Recovered child outcomes left for the next write");
        }

        tracing::info!(
            executions = engine.executions.len(),
            running = engine.registry.running_count(),
            "Engine recovered from history store"
        );
        Ok((engine, effects))
    }

    /// Outcomes of closed children their running parents never recorded
    fn undelivered_child_outcomes(&self) -> Vec<(ExecutionKey, EventKind)> {
        let mut outcomes = Vec::new();
        for (key, state) in &self.executions {
            if !state.execution.is_running() {
                continue;
            }
            for (seq, child) in &state.children {
                let recorded = state.execution.history.events().iter().any(|e| {
                    matches!(
                        &e.kind,
                        EventKind::ChildWorkflowCompleted { seq: s, .. }
                            | EventKind::ChildWorkflowFailed { seq: s, .. } if s == seq
                    )
                });
                if recorded {
                    continue;
                }
                let Some(child_state) = self.executions.get(&child.key) else {
                    continue;
                };
                if let Some(outcome) = child_state.execution.outcome() {
                    let workflow_type = child_state.execution.workflow_type.clone();
                    outcomes.push((key.clone(), child_outcome_event(*seq, workflow_type, &child.key, outcome)));
                }
            }
        }
        outcomes
    }

    fn rearm(&mut self, execution: &WorkflowExecution, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let key = &execution.key;
        let remaining = |since: DateTime<Utc>, duration: Duration| {
            let elapsed = (now - since).to_std().unwrap_or_default();
            duration.saturating_sub(elapsed)
        };

        if let Some(timeout) = execution.execution_timeout {
            effects.push(Effect::StartTimer {
                id: TimerId::ExecutionTimeout { key: key.clone() },
                after: remaining(execution.started_at, timeout),
            });
        }

        let events = execution.history.events();
        let mut resolved = HashSet::new();
        for event in events {
            match &event.kind {
                EventKind::TimerFired { seq }
                | EventKind::ActivityTaskCompleted { seq, .. }
                | EventKind::ActivityTaskFailed { seq, .. } => {
                    resolved.insert(*seq);
                }
                _ => {}
            }
        }

        for event in events {
            match &event.kind {
                EventKind::TimerStarted { seq, duration } if !resolved.contains(seq) => {
                    effects.push(Effect::StartTimer {
                        id: TimerId::Workflow {
                            key: key.clone(),
                            seq: *seq,
                        },
                        after: remaining(event.timestamp, *duration),
                    });
                }
                EventKind::ActivityTaskScheduled {
                    seq,
                    activity_type,
                    input,
                    options,
                } if !resolved.contains(seq) => {
                    let id = ActivityInvocationId::new(key.clone(), *seq);
                    let invocation = self.dispatcher.schedule(
                        id.clone(),
                        activity_type.clone(),
                        input.clone(),
                        options.clone(),
                        &execution.task_queue,
                    );
                    effects.push(Effect::EnqueueActivityTask {
                        queue: invocation.task_queue.clone(),
                        invocation: id.clone(),
                        activity_type: activity_type.clone(),
                        attempt: invocation.attempt,
                    });
                    if let Some(deadline) = options.schedule_to_close_timeout {
                        effects.push(Effect::StartTimer {
                            id: TimerId::ActivityDeadline { invocation: id },
                            after: remaining(event.timestamp, deadline),
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

/// The input a parent receives when its child closes
fn child_outcome_event(
    seq: u64,
    workflow_type: WorkflowType,
    child: &ExecutionKey,
    outcome: Result<Payload, Failure>,
) -> EventKind {
    match outcome {
        Ok(result) => EventKind::ChildWorkflowCompleted { seq, result },
        Err(failure) => EventKind::ChildWorkflowFailed {
            seq,
            failure: Failure::child_workflow(
                workflow_type,
                child.workflow_id.clone(),
                Some(child.run_id.clone()),
                failure,
            ),
        },
    }
}

/// Children started by an execution, from its history
fn recorded_children(history: &History) -> BTreeMap<u64, ChildRef> {
    let mut initiated = HashMap::new();
    let mut children = BTreeMap::new();
    for event in history.events() {
        match &event.kind {
            EventKind::StartChildWorkflowInitiated {
                seq,
                workflow_id,
                options,
                ..
            } => {
                initiated.insert(*seq, (workflow_id.clone(), options.parent_close_policy));
            }
            EventKind::ChildWorkflowStarted { seq, run_id } => {
                if let Some((workflow_id, policy)) = initiated.get(seq) {
                    children.insert(
                        *seq,
                        ChildRef {
                            key: ExecutionKey::new(workflow_id.clone(), run_id.clone()),
                            policy: *policy,
                        },
                    );
                }
            }
            _ => {}
        }
    }
    children
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("executions", &self.executions.len())
            .field("running", &self.registry.running_count())
            .field("pending_activities", &self.dispatcher.pending_count())
            .finish_non_exhaustive()
    }
}
