//! Replay: re-executing workflow logic against recorded history
//!
//! A history is cut into turns at each `WorkflowTaskCompleted` event. For
//! every historical turn the runner reveals the input events the task saw
//! when it started, polls the workflow until it stops making progress, and
//! checks that the commands it produced are exactly the command events
//! recorded after that boundary. The commands of the final, live turn are
//! the new decisions of the workflow task.
//!
//! The workflow future is polled with a no-op waker: every suspension point
//! reads revealed state directly, so re-polling after each batch of events
//! is all the scheduling it needs.

use crate::context::{WorkflowContext, WorkflowInfo};
use crate::definition::{WorkflowDefinition, WorkflowFuture};
use chrono::{DateTime, Utc};
use futures::task::noop_waker_ref;
use std::collections::HashMap;
use std::task::{Context, Poll};
use workflow_types::*;

/// Upper bound on polls within one turn; each productive poll resolves at
/// least one suspension point, so only a runaway condition reaches it.
const MAX_POLLS_PER_TURN: usize = 10_000;

/// Error type of the failure recorded for a non-deterministic workflow
pub const NON_DETERMINISTIC_ERROR: &str = "NonDeterministicWorkflow";

struct Turn {
    inputs: Vec<EventKind>,
    task_time: DateTime<Utc>,
    recorded: Vec<EventKind>,
}

/// Replays one execution's history and runs its next turn
pub struct ReplayRunner {
    key: ExecutionKey,
    ctx: WorkflowContext,
    future: Option<WorkflowFuture>,
    result: Option<Result<Payload, Failure>>,
    turns: Vec<Turn>,
    pending_inputs: Vec<EventKind>,
}

impl ReplayRunner {
    /// Prepare a run of `definition` over `history`
    pub fn new(
        definition: &dyn WorkflowDefinition,
        run_id: RunId,
        history: &[HistoryEvent],
    ) -> WorkflowResult<Self> {
        let (started, rest) = history
            .split_first()
            .ok_or_else(|| WorkflowError::HistoryCorrupted("empty history".into()))?;
        let EventKind::WorkflowExecutionStarted {
            workflow_type,
            workflow_id,
            task_queue,
            input,
            parent,
            ..
        } = &started.kind
        else {
            return Err(WorkflowError::HistoryCorrupted(format!(
                "history starts with {}",
                started.kind.name()
            )));
        };

        let key = ExecutionKey::new(workflow_id.clone(), run_id.clone());
        let (turns, pending_inputs) = split_turns(&key, rest)?;
        let markers: HashMap<String, Payload> = rest
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::MarkerRecorded { name, value } => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect();

        let ctx = WorkflowContext::new(
            WorkflowInfo {
                workflow_id: workflow_id.clone(),
                run_id,
                workflow_type: workflow_type.clone(),
                task_queue: task_queue.clone(),
                parent: parent.as_ref().map(|p| p.key.clone()),
                started_at: started.timestamp,
            },
            markers,
        );
        let future = definition.run(ctx.clone(), input.clone());

        Ok(Self {
            key,
            ctx,
            future: Some(future),
            result: None,
            turns,
            pending_inputs,
        })
    }

    /// Re-execute every recorded turn, verifying the decisions
    pub fn replay(&mut self) -> WorkflowResult<()> {
        self.ctx.set_replaying(true);
        let turns = std::mem::take(&mut self.turns);
        for (index, turn) in turns.into_iter().enumerate() {
            for input in &turn.inputs {
                self.ctx.apply(input);
            }
            self.ctx.set_now(turn.task_time);
            self.poll_until_stalled();
            let produced = self.ctx.take_commands();
            self.verify(index + 1, &produced, &turn.recorded)?;
        }
        self.ctx.set_replaying(false);
        Ok(())
    }

    /// Run the live turn: reveal unprocessed events and return new commands
    pub fn run_turn(&mut self, task_time: DateTime<Utc>) -> Vec<Command> {
        self.ctx.set_replaying(false);
        for input in std::mem::take(&mut self.pending_inputs) {
            self.ctx.apply(&input);
        }
        self.ctx.set_now(task_time);
        self.poll_until_stalled();
        self.ctx.take_commands()
    }

    /// The workflow's return value, once it has returned
    pub fn result(&self) -> Option<&Result<Payload, Failure>> {
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    fn poll_until_stalled(&mut self) {
        let mut cx = Context::from_waker(noop_waker_ref());
        for _ in 0..MAX_POLLS_PER_TURN {
            let Some(future) = self.future.as_mut() else {
                return;
            };
            let before = self.ctx.generation();
            let poll = future.as_mut().poll(&mut cx);
            if let Poll::Ready(result) = poll {
                self.future = None;
                self.ctx.emit(self.closing_command(&result));
                self.result = Some(result);
                return;
            }
            if self.ctx.generation() == before {
                return;
            }
        }
        tracing::warn!(execution = %self.key, "Workflow kept making progress without settling");
    }

    fn closing_command(&self, result: &Result<Payload, Failure>) -> Command {
        match result {
            Ok(value) => Command::CompleteWorkflow {
                result: value.clone(),
            },
            Err(failure) if failure.is_cancelled() && self.ctx.is_cancel_requested() => {
                Command::CancelWorkflow {
                    failure: failure.clone(),
                }
            }
            Err(failure) => Command::FailWorkflow {
                failure: failure.clone(),
            },
        }
    }

    fn verify(&self, turn: usize, produced: &[Command], recorded: &[EventKind]) -> WorkflowResult<()> {
        for (index, expected) in recorded.iter().enumerate() {
            match produced.get(index) {
                Some(command) if command.matches_event(expected) => {}
                Some(command) => {
                    return Err(self.non_determinism(format!(
                        "turn {}: produced {} where history recorded {}",
                        turn,
                        command.name(),
                        expected.name()
                    )))
                }
                None => {
                    return Err(self.non_determinism(format!(
                        "turn {}: history recorded {} but the workflow did not produce it",
                        turn,
                        expected.name()
                    )))
                }
            }
        }
        if let Some(extra) = produced.get(recorded.len()) {
            return Err(self.non_determinism(format!(
                "turn {}: produced {} which history does not record",
                turn,
                extra.name()
            )));
        }
        Ok(())
    }

    fn non_determinism(&self, message: String) -> WorkflowError {
        WorkflowError::NonDeterminism {
            key: self.key.clone(),
            message,
        }
    }
}

/// Cut history (after the start event) into recorded turns plus the input
/// events that arrived after the last boundary.
///
/// A turn sees the inputs recorded before its `WorkflowTaskStarted`; inputs
/// recorded while the task ran are carried to the following turn. History
/// ends at a `WorkflowTaskFailed`: the logic made no decisions there and the
/// terminal event after it was written by the engine.
fn split_turns(key: &ExecutionKey, events: &[HistoryEvent]) -> WorkflowResult<(Vec<Turn>, Vec<EventKind>)> {
    let mut turns = Vec::new();
    let mut inputs = Vec::new();
    let mut seen_at_start: Option<usize> = None;
    let mut current: Option<Turn> = None;

    for event in events {
        match &event.kind {
            EventKind::WorkflowTaskStarted => seen_at_start = Some(inputs.len()),
            EventKind::WorkflowTaskCompleted { task_time } => {
                let seen = seen_at_start.take().unwrap_or(inputs.len());
                let later = inputs.split_off(seen);
                turns.extend(current.take());
                current = Some(Turn {
                    inputs: std::mem::replace(&mut inputs, later),
                    task_time: *task_time,
                    recorded: Vec::new(),
                });
            }
            EventKind::WorkflowTaskFailed { .. } => {
                turns.extend(current);
                return Ok((turns, Vec::new()));
            }
            kind if kind.is_command() => match current.as_mut() {
                Some(turn) => turn.recorded.push(kind.clone()),
                None => {
                    return Err(WorkflowError::HistoryCorrupted(format!(
                        "{}: {} recorded before any workflow task",
                        key,
                        kind.name()
                    )))
                }
            },
            kind if kind.is_input() => inputs.push(kind.clone()),
            _ => {}
        }
    }
    turns.extend(current);
    Ok((turns, inputs))
}

/// Outcome of a workflow task
#[derive(Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    pub commands: Vec<Command>,
}

/// Replay `history` and run the next turn at `task_time`
pub fn run_workflow_task(
    definition: &dyn WorkflowDefinition,
    run_id: RunId,
    history: &[HistoryEvent],
    task_time: DateTime<Utc>,
) -> WorkflowResult<TaskOutcome> {
    let mut runner = ReplayRunner::new(definition, run_id, history)?;
    runner.replay()?;
    Ok(TaskOutcome {
        commands: runner.run_turn(task_time),
    })
}

/// Re-run a recorded history and return what the workflow returned.
///
/// Fails with `NonDeterminism` if the logic no longer makes the recorded
/// decisions; returns `None` if the history ends before the logic returns.
pub fn replay_history(
    definition: &dyn WorkflowDefinition,
    run_id: RunId,
    history: &[HistoryEvent],
) -> WorkflowResult<Option<Result<Payload, Failure>>> {
    let mut runner = ReplayRunner::new(definition, run_id, history)?;
    runner.replay()?;
    Ok(runner.result().cloned())
}

/// Failure recorded on an execution whose logic diverged from its history
pub fn non_determinism_failure(error: &WorkflowError) -> Failure {
    Failure::non_retryable(NON_DETERMINISTIC_ERROR, error.to_string())
}
