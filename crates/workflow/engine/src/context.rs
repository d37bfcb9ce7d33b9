//! Workflow context: the only door between workflow logic and the world
//!
//! Every call that needs the outside world (activities, timers, children,
//! signals, time, randomness) goes through [`WorkflowContext`]. Calls that
//! start something emit a [`Command`] immediately and return a future that
//! stays pending until the matching result has been revealed from history.
//! The futures never register wakers: the replay runner re-polls the
//! workflow after each batch of events, so a pending future is simply
//! polled again later.

use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;
use workflow_types::*;

/// Identity of the running workflow
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowInfo {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub parent: Option<ExecutionKey>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowInfo {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(self.workflow_id.clone(), self.run_id.clone())
    }
}

/// Version returned by `get_version` for code paths recorded before the change
pub const DEFAULT_VERSION: i32 = -1;

pub(crate) struct ContextState {
    info: WorkflowInfo,
    now: DateTime<Utc>,
    replaying: bool,
    next_seq: u64,
    side_effects: u64,
    commands: Vec<Command>,
    activity_results: HashMap<u64, Result<Payload, Failure>>,
    timers_fired: HashSet<u64>,
    child_starts: HashMap<u64, Result<RunId, Failure>>,
    child_results: HashMap<u64, Result<Payload, Failure>>,
    signals: HashMap<String, VecDeque<Payload>>,
    cancel_requested: Option<String>,
    /// Marker values recorded anywhere in history, by name
    markers: HashMap<String, Payload>,
    versions: HashMap<String, i32>,
    rng: StdRng,
    /// Bumped whenever a suspension point resolves
    generation: u64,
}

/// Handle passed to workflow logic.
///
/// Cheap to clone; all clones share the same state. Not `Send`: a workflow
/// run lives on the thread replaying it.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Rc<RefCell<ContextState>>,
}

impl WorkflowContext {
    pub(crate) fn new(info: WorkflowInfo, markers: HashMap<String, Payload>) -> Self {
        let rng = StdRng::seed_from_u64(info.run_id.seed());
        let now = info.started_at;
        Self {
            state: Rc::new(RefCell::new(ContextState {
                info,
                now,
                replaying: false,
                next_seq: 1,
                side_effects: 0,
                commands: Vec::new(),
                activity_results: HashMap::new(),
                timers_fired: HashSet::new(),
                child_starts: HashMap::new(),
                child_results: HashMap::new(),
                signals: HashMap::new(),
                cancel_requested: None,
                markers,
                versions: HashMap::new(),
                rng,
                generation: 0,
            })),
        }
    }

    // ── Information ──────────────────────────────────────────────────

    pub fn info(&self) -> WorkflowInfo {
        self.state.borrow().info.clone()
    }

    /// Logical time: the start time, then the time each workflow task began
    pub fn now(&self) -> DateTime<Utc> {
        self.state.borrow().now
    }

    /// True while re-executing decisions already recorded in history
    pub fn is_replaying(&self) -> bool {
        self.state.borrow().replaying
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.borrow().cancel_requested.is_some()
    }

    // ── Activities ───────────────────────────────────────────────────

    /// Schedule an activity and return a future for its final result.
    ///
    /// The activity is scheduled even if the future is never awaited.
    pub fn execute_activity(
        &self,
        activity_type: impl Into<ActivityType>,
        input: Payload,
        options: ActivityOptions,
    ) -> ActivityFuture {
        let seq = self.emit_with_seq(|seq| Command::ScheduleActivity {
            seq,
            activity_type: activity_type.into(),
            input,
            options,
        });
        ActivityFuture {
            ctx: self.clone(),
            seq,
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Suspend this workflow for `duration` of durable time
    pub fn sleep(&self, duration: Duration) -> TimerFuture {
        let seq = self.emit_with_seq(|seq| Command::StartTimer { seq, duration });
        TimerFuture {
            ctx: self.clone(),
            seq,
        }
    }

    // ── Child workflows ──────────────────────────────────────────────

    /// Start a child workflow. Without an explicit id one is derived from
    /// this workflow's id and the call's sequence number.
    pub fn start_child_workflow(
        &self,
        workflow_type: impl Into<WorkflowType>,
        input: Payload,
        options: ChildWorkflowOptions,
    ) -> ChildWorkflowHandle {
        let workflow_type = workflow_type.into();
        let parent_id = self.state.borrow().info.workflow_id.clone();
        let mut child_id = None;
        let seq = self.emit_with_seq(|seq| {
            let workflow_id = options
                .workflow_id
                .clone()
                .unwrap_or_else(|| derived_child_id(&parent_id, seq));
            child_id = Some(workflow_id.clone());
            Command::StartChildWorkflow {
                seq,
                workflow_type: workflow_type.clone(),
                workflow_id,
                input,
                options,
            }
        });
        ChildWorkflowHandle {
            ctx: self.clone(),
            seq,
            workflow_type,
            workflow_id: child_id.unwrap_or_else(|| derived_child_id(&parent_id, seq)),
        }
    }

    /// Start a child workflow and wait for its result
    pub async fn execute_child_workflow(
        &self,
        workflow_type: impl Into<WorkflowType>,
        input: Payload,
        options: ChildWorkflowOptions,
    ) -> Result<Payload, Failure> {
        self.start_child_workflow(workflow_type, input, options)
            .result()
            .await
    }

    // ── Signals and cancellation ─────────────────────────────────────

    /// Wait for the next signal named `name`
    pub fn wait_signal(&self, name: impl Into<String>) -> SignalFuture {
        SignalFuture {
            ctx: self.clone(),
            name: name.into(),
        }
    }

    /// Wait until `predicate` holds. It is re-evaluated whenever the
    /// workflow makes progress, so it must only read workflow state.
    pub fn wait_condition<F>(&self, predicate: F) -> ConditionFuture
    where
        F: FnMut() -> bool + 'static,
    {
        ConditionFuture {
            ctx: self.clone(),
            predicate: Box::new(predicate),
        }
    }

    /// Resolves with the reason once cancellation of this workflow is requested
    pub fn cancelled(&self) -> CancellationFuture {
        CancellationFuture { ctx: self.clone() }
    }

    // ── Deterministic helpers ────────────────────────────────────────

    /// Run `f` once and record its value; replays return the recorded value
    pub fn side_effect<T, F>(&self, f: F) -> Result<T, Failure>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let name = {
            let mut state = self.state.borrow_mut();
            state.side_effects += 1;
            format!("side_effect:{}", state.side_effects)
        };
        let recorded = self.state.borrow().markers.get(&name).cloned();
        let value = match recorded {
            Some(value) => value,
            None => encode(&f())?,
        };
        self.emit(Command::RecordMarker {
            name,
            value: value.clone(),
        });
        decode(&value)
    }

    /// Version of a code change to follow. New executions get
    /// `max_supported`; executions that passed this point before the change
    /// was introduced get [`DEFAULT_VERSION`].
    pub fn get_version(&self, change_id: &str, min_supported: i32, max_supported: i32) -> Result<i32, Failure> {
        if let Some(version) = self.state.borrow().versions.get(change_id) {
            return Ok(*version);
        }
        let name = format!("version:{}", change_id);
        let (recorded, replaying) = {
            let state = self.state.borrow();
            (state.markers.get(&name).cloned(), state.replaying)
        };
        let version = match recorded {
            Some(value) => {
                let version: i32 = decode(&value)?;
                self.emit(Command::RecordMarker { name, value });
                version
            }
            None if replaying => DEFAULT_VERSION,
            None => {
                self.emit(Command::RecordMarker {
                    name,
                    value: Payload::from(max_supported),
                });
                max_supported
            }
        };
        if version != DEFAULT_VERSION && (version < min_supported || version > max_supported) {
            return Err(Failure::non_retryable(
                "UnsupportedVersion",
                format!(
                    "version {} of '{}' is outside supported range {}..={}",
                    version, change_id, min_supported, max_supported
                ),
            ));
        }
        self.state
            .borrow_mut()
            .versions
            .insert(change_id.to_string(), version);
        Ok(version)
    }

    /// Random value from a generator seeded by the run id
    pub fn random<T>(&self) -> T
    where
        Standard: Distribution<T>,
    {
        self.state.borrow_mut().rng.gen()
    }

    /// Random v4 UUID from the seeded generator
    pub fn random_uuid(&self) -> uuid::Uuid {
        let bytes: [u8; 16] = self.state.borrow_mut().rng.gen();
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    // ── Runner interface ─────────────────────────────────────────────

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.state.borrow_mut().replaying = replaying;
    }

    pub(crate) fn set_now(&self, now: DateTime<Utc>) {
        self.state.borrow_mut().now = now;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.state.borrow_mut().commands)
    }

    pub(crate) fn emit(&self, command: Command) {
        self.state.borrow_mut().commands.push(command);
    }

    /// Reveal an input event to the logic
    pub(crate) fn apply(&self, event: &EventKind) {
        let mut state = self.state.borrow_mut();
        match event {
            EventKind::ActivityTaskCompleted { seq, result, .. } => {
                state.activity_results.insert(*seq, Ok(result.clone()));
            }
            EventKind::ActivityTaskFailed { seq, failure, .. } => {
                state.activity_results.insert(*seq, Err(failure.clone()));
            }
            EventKind::TimerFired { seq } => {
                state.timers_fired.insert(*seq);
            }
            EventKind::ChildWorkflowStarted { seq, run_id } => {
                state.child_starts.insert(*seq, Ok(run_id.clone()));
            }
            EventKind::StartChildWorkflowFailed { seq, failure } => {
                state.child_starts.insert(*seq, Err(failure.clone()));
                state.child_results.insert(*seq, Err(failure.clone()));
            }
            EventKind::ChildWorkflowCompleted { seq, result } => {
                state.child_results.insert(*seq, Ok(result.clone()));
            }
            EventKind::ChildWorkflowFailed { seq, failure } => {
                state.child_results.insert(*seq, Err(failure.clone()));
            }
            EventKind::SignalReceived { name, payload } => {
                state
                    .signals
                    .entry(name.clone())
                    .or_default()
                    .push_back(payload.clone());
            }
            EventKind::CancelRequested { reason } => {
                state.cancel_requested.get_or_insert_with(|| reason.clone());
            }
            other => {
                tracing::trace!(event = other.name(), "Event carries nothing for the logic");
            }
        }
    }

    fn emit_with_seq(&self, build: impl FnOnce(u64) -> Command) -> u64 {
        let seq = {
            let mut state = self.state.borrow_mut();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };
        let command = build(seq);
        self.emit(command);
        seq
    }

    fn resolved<T>(&self, value: T) -> Poll<T> {
        self.state.borrow_mut().generation += 1;
        Poll::Ready(value)
    }
}

// ── Futures ──────────────────────────────────────────────────────────

/// Final result of an activity invocation
pub struct ActivityFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl ActivityFuture {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for ActivityFuture {
    type Output = Result<Payload, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = self.ctx.state.borrow().activity_results.get(&self.seq).cloned();
        match result {
            Some(result) => self.ctx.resolved(result),
            None => Poll::Pending,
        }
    }
}

/// Completion of a durable timer
pub struct TimerFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let fired = self.ctx.state.borrow().timers_fired.contains(&self.seq);
        if fired {
            self.ctx.resolved(())
        } else {
            Poll::Pending
        }
    }
}

/// Non-owning reference to a child workflow started by this workflow.
///
/// The start acknowledgement and the result are awaited independently.
pub struct ChildWorkflowHandle {
    ctx: WorkflowContext,
    seq: u64,
    workflow_type: WorkflowType,
    workflow_id: WorkflowId,
}

impl ChildWorkflowHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn workflow_type(&self) -> &WorkflowType {
        &self.workflow_type
    }

    /// Resolves with the child's run id once it has started, or with the
    /// start failure (e.g. an `AlreadyStarted` cause)
    pub fn started(&self) -> ChildStartFuture {
        ChildStartFuture {
            ctx: self.ctx.clone(),
            seq: self.seq,
        }
    }

    /// Resolves with the child's result, or a `ChildWorkflow` failure
    pub fn result(&self) -> ChildResultFuture {
        ChildResultFuture {
            ctx: self.ctx.clone(),
            seq: self.seq,
        }
    }
}

pub struct ChildStartFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for ChildStartFuture {
    type Output = Result<RunId, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let started = self.ctx.state.borrow().child_starts.get(&self.seq).cloned();
        match started {
            Some(started) => self.ctx.resolved(started),
            None => Poll::Pending,
        }
    }
}

pub struct ChildResultFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for ChildResultFuture {
    type Output = Result<Payload, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = self.ctx.state.borrow().child_results.get(&self.seq).cloned();
        match result {
            Some(result) => self.ctx.resolved(result),
            None => Poll::Pending,
        }
    }
}

/// Next payload of a named signal
pub struct SignalFuture {
    ctx: WorkflowContext,
    name: String,
}

impl Future for SignalFuture {
    type Output = Payload;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Payload> {
        let payload = self
            .ctx
            .state
            .borrow_mut()
            .signals
            .get_mut(&self.name)
            .and_then(VecDeque::pop_front);
        match payload {
            Some(payload) => self.ctx.resolved(payload),
            None => Poll::Pending,
        }
    }
}

pub struct ConditionFuture {
    ctx: WorkflowContext,
    predicate: Box<dyn FnMut() -> bool>,
}

impl Future for ConditionFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if (self.predicate)() {
            self.ctx.resolved(())
        } else {
            Poll::Pending
        }
    }
}

pub struct CancellationFuture {
    ctx: WorkflowContext,
}

impl Future for CancellationFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<String> {
        let reason = self.ctx.state.borrow().cancel_requested.clone();
        match reason {
            Some(reason) => self.ctx.resolved(reason),
            None => Poll::Pending,
        }
    }
}
