//! Task queues: pending workflow and activity tasks per named queue
//!
//! A poll hands out exactly one entry the poller is capable of executing.
//! The entry stays leased for the visibility timeout; if its delivery is not
//! acknowledged in time it returns to the front of the queue with a higher
//! delivery count, so a stalled worker's task reaches another worker.
//! Entries no registered worker can execute stay pending.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use workflow_types::{TaskKind, TaskQueueEntry, TaskQueueName, TaskToken, WorkflowError, WorkflowResult};

/// Task types a poller is able to execute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    workflows: HashSet<String>,
    activities: HashSet<String>,
}

impl Capabilities {
    pub fn new(
        workflows: impl IntoIterator<Item = String>,
        activities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            workflows: workflows.into_iter().collect(),
            activities: activities.into_iter().collect(),
        }
    }

    pub fn workflows_only(&self) -> Self {
        Self {
            workflows: self.workflows.clone(),
            activities: HashSet::new(),
        }
    }

    pub fn activities_only(&self) -> Self {
        Self {
            workflows: HashSet::new(),
            activities: self.activities.clone(),
        }
    }

    pub fn accepts_workflow(&self, workflow_type: &str) -> bool {
        self.workflows.contains(workflow_type)
    }

    pub fn accepts_activity(&self, activity_type: &str) -> bool {
        self.activities.contains(activity_type)
    }

    pub fn accepts(&self, entry: &TaskQueueEntry) -> bool {
        match entry.kind {
            TaskKind::Workflow { .. } => self.accepts_workflow(&entry.type_name),
            TaskKind::Activity { .. } => self.accepts_activity(&entry.type_name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

struct Lease {
    entry: TaskQueueEntry,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<TaskQueueName, VecDeque<TaskQueueEntry>>,
    leases: HashMap<u64, Lease>,
    /// Entries already reported as having no capable poller
    unmatched_reported: HashSet<u64>,
    next_entry_id: u64,
}

impl QueueState {
    /// Return expired leases to the front of their queue
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for entry_id in expired {
            if let Some(lease) = self.leases.remove(&entry_id) {
                tracing::warn!(
                    entry_id,
                    task_queue = %lease.entry.queue,
                    deliveries = lease.entry.delivery_count,
                    "Task lease expired; redelivering"
                );
                self.pending
                    .entry(lease.entry.queue.clone())
                    .or_default()
                    .push_front(lease.entry);
            }
        }
    }

    fn take_matching(
        &mut self,
        queue: &TaskQueueName,
        capabilities: &Capabilities,
        visibility_timeout: Duration,
        now: Instant,
    ) -> Option<(TaskQueueEntry, TaskToken)> {
        let pending = self.pending.get_mut(queue)?;
        let position = pending.iter().position(|e| capabilities.accepts(e));

        for entry in pending.iter().take(position.unwrap_or(pending.len())) {
            if self.unmatched_reported.insert(entry.entry_id) {
                tracing::warn!(
                    entry_id = entry.entry_id,
                    task_queue = %queue,
                    type_name = %entry.type_name,
                    "No capable poller for task; leaving it pending"
                );
            }
        }

        let mut entry = pending.remove(position?)?;
        entry.delivery_count += 1;
        let token = TaskToken {
            entry_id: entry.entry_id,
            delivery: entry.delivery_count,
        };
        self.unmatched_reported.remove(&entry.entry_id);
        self.leases.insert(
            entry.entry_id,
            Lease {
                entry: entry.clone(),
                expires_at: now + visibility_timeout,
            },
        );
        Some((entry, token))
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leases.values().map(|l| l.expires_at).min()
    }
}

/// All task queues of a service
pub struct TaskQueues {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl TaskQueues {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a task to the back of `queue`
    pub fn push(&self, queue: &TaskQueueName, kind: TaskKind, type_name: impl Into<String>) -> u64 {
        let entry_id = {
            let mut state = self.lock();
            let entry_id = state.next_entry_id;
            state.next_entry_id += 1;
            let entry = TaskQueueEntry {
                entry_id,
                queue: queue.clone(),
                kind,
                type_name: type_name.into(),
                enqueued_at: Utc::now(),
                delivery_count: 0,
            };
            tracing::trace!(entry_id, task_queue = %queue, type_name = %entry.type_name, "Task enqueued");
            state.pending.entry(queue.clone()).or_default().push_back(entry);
            entry_id
        };
        self.notify.notify_waiters();
        entry_id
    }

    /// Take one task without waiting
    pub fn try_poll(
        &self,
        queue: &TaskQueueName,
        capabilities: &Capabilities,
    ) -> Option<(TaskQueueEntry, TaskToken)> {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim_expired(now);
        state.take_matching(queue, capabilities, self.visibility_timeout, now)
    }

    /// Wait up to `timeout` for a task this poller can execute
    pub async fn poll(
        &self,
        queue: &TaskQueueName,
        capabilities: &Capabilities,
        timeout: Duration,
    ) -> Option<(TaskQueueEntry, TaskToken)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_poll(queue, capabilities) {
                return Some(task);
            }
            if Instant::now() >= deadline {
                return None;
            }

            let wake_at = match self.lock().next_expiry() {
                Some(expiry) => expiry.min(deadline),
                None => deadline,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Acknowledge a delivery, removing the entry for good
    pub fn ack(&self, token: TaskToken) -> WorkflowResult<()> {
        let mut state = self.lock();
        match state.leases.get(&token.entry_id) {
            Some(lease) if lease.entry.delivery_count == token.delivery => {
                state.leases.remove(&token.entry_id);
                tracing::trace!(token = %token, "Task acknowledged");
                Ok(())
            }
            _ => Err(WorkflowError::StaleTask(format!(
                "delivery {} is no longer leased",
                token
            ))),
        }
    }

    /// Entries waiting on `queue`, excluding leased ones
    pub fn pending_len(&self, queue: &TaskQueueName) -> usize {
        self.lock().pending.get(queue).map_or(0, VecDeque::len)
    }

    pub fn leased_len(&self) -> usize {
        self.lock().leases.len()
    }
}

impl std::fmt::Debug for TaskQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueues")
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}
