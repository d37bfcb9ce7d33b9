//! Timer service: durable timers, activity timeouts and retry backoff
//!
//! Timers run on the tokio clock, independently of any worker. When one
//! elapses its [`TimerId`] is sent to the service loop, which hands it to the
//! engine. The engine decides whether the firing still matters and ignores
//! stale ones. Timers that can no longer matter (the deadline of an attempt
//! that finished, anything of a closed execution) are disarmed so their
//! tasks do not linger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use workflow_types::{ActivityInvocationId, ExecutionKey};

/// What a timer is for
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// A `sleep` started by workflow logic
    Workflow { key: ExecutionKey, seq: u64 },
    /// Start-to-close deadline of one activity attempt
    ActivityTimeout {
        invocation: ActivityInvocationId,
        attempt: u32,
    },
    /// Schedule-to-close deadline of an activity invocation
    ActivityDeadline { invocation: ActivityInvocationId },
    /// Backoff before the next activity attempt is dispatched
    ActivityBackoff {
        invocation: ActivityInvocationId,
        attempt: u32,
    },
    /// Execution timeout of a workflow run
    ExecutionTimeout { key: ExecutionKey },
}

impl TimerId {
    /// The execution the timer belongs to
    pub fn execution(&self) -> &ExecutionKey {
        match self {
            Self::Workflow { key, .. } | Self::ExecutionTimeout { key } => key,
            Self::ActivityTimeout { invocation, .. }
            | Self::ActivityDeadline { invocation }
            | Self::ActivityBackoff { invocation, .. } => &invocation.execution,
        }
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow { key, seq } => write!(f, "sleep {}#{}", key, seq),
            Self::ActivityTimeout {
                invocation,
                attempt,
            } => write!(f, "start-to-close {} attempt {}", invocation, attempt),
            Self::ActivityDeadline { invocation } => write!(f, "schedule-to-close {}", invocation),
            Self::ActivityBackoff {
                invocation,
                attempt,
            } => write!(f, "backoff {} attempt {}", invocation, attempt),
            Self::ExecutionTimeout { key } => write!(f, "execution timeout {}", key),
        }
    }
}

#[derive(Debug, Default)]
struct Armed {
    next_generation: u64,
    timers: HashMap<TimerId, (u64, JoinHandle<()>)>,
}

/// Arms tokio timers and reports them when they elapse
#[derive(Clone, Debug)]
pub struct TimerService {
    fired: mpsc::UnboundedSender<TimerId>,
    armed: Arc<Mutex<Armed>>,
}

impl TimerService {
    /// Create the service and the receiver that yields elapsed timers
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let service = Self {
            fired,
            armed: Arc::new(Mutex::new(Armed::default())),
        };
        (service, rx)
    }

    /// Report `id` once `after` has elapsed. Re-arming an armed id replaces it.
    pub fn schedule(&self, id: TimerId, after: Duration) {
        tracing::trace!(timer = %id, after_ms = after.as_millis() as u64, "Timer armed");
        let mut armed = lock(&self.armed);
        let generation = armed.next_generation;
        armed.next_generation += 1;

        let task = tokio::spawn({
            let fired = self.fired.clone();
            let registry = Arc::clone(&self.armed);
            let id = id.clone();
            async move {
                tokio::time::sleep(after).await;
                {
                    let mut armed = lock(&registry);
                    if armed.timers.get(&id).is_some_and(|(g, _)| *g == generation) {
                        armed.timers.remove(&id);
                    }
                }
                tracing::trace!(timer = %id, "Timer elapsed");
                let _ = fired.send(id);
            }
        });
        if let Some((_, replaced)) = armed.timers.insert(id, (generation, task)) {
            replaced.abort();
        }
    }

    /// Disarm `id` if it has not fired yet
    pub fn cancel(&self, id: &TimerId) {
        if let Some((_, task)) = lock(&self.armed).timers.remove(id) {
            task.abort();
            tracing::trace!(timer = %id, "Timer disarmed");
        }
    }

    /// Disarm every timer of `key`
    pub fn cancel_execution(&self, key: &ExecutionKey) {
        let mut armed = lock(&self.armed);
        armed.timers.retain(|id, (_, task)| {
            let keep = id.execution() != key;
            if !keep {
                task.abort();
            }
            keep
        });
    }

    /// Number of timers waiting to fire
    pub fn armed_count(&self) -> usize {
        lock(&self.armed).timers.len()
    }
}

fn lock(armed: &Mutex<Armed>) -> MutexGuard<'_, Armed> {
    armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
