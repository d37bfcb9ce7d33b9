//! Workflow registry: enforces workflow id uniqueness
//!
//! Reservation is a single check-and-insert. Within one task queue at most
//! one run of a workflow id is running at a time; closed runs stay indexed so
//! lookups by id keep working and reuse policies can be applied.

use std::collections::HashMap;
use workflow_types::{
    ExecutionKey, RunId, TaskQueueName, WorkflowError, WorkflowId, WorkflowIdReusePolicy,
    WorkflowResult, WorkflowStatus, WorkflowType,
};

/// Where a run of a workflow id lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRef {
    pub key: ExecutionKey,
    pub workflow_type: WorkflowType,
    pub task_queue: TaskQueueName,
    pub status: WorkflowStatus,
    /// Registration order, used to pick the most recent run
    sequence: u64,
}

impl ExecutionRef {
    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }
}

/// Registry of workflow ids and their runs
#[derive(Clone, Debug, Default)]
pub struct WorkflowRegistry {
    /// All runs of each id within a queue, oldest first
    runs: HashMap<(TaskQueueName, WorkflowId), Vec<ExecutionRef>>,
    /// Queues a workflow id has been used on
    queues_by_id: HashMap<WorkflowId, Vec<TaskQueueName>>,
    next_sequence: u64,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `workflow_id` on `queue` for a new run.
    ///
    /// Fails with `AlreadyStarted` if a run is still going, or if the reuse
    /// policy forbids following the most recent closed run.
    pub fn reserve(
        &mut self,
        queue: &TaskQueueName,
        workflow_id: &WorkflowId,
        workflow_type: &WorkflowType,
        reuse_policy: WorkflowIdReusePolicy,
    ) -> WorkflowResult<RunId> {
        let slot = (queue.clone(), workflow_id.clone());
        let runs = self.runs.entry(slot).or_default();

        let rejected = match runs.last() {
            Some(last) if last.is_running() => true,
            Some(last) => !reuse_policy.allows_reuse_after(last.status),
            None => false,
        };
        if rejected {
            tracing::debug!(
                workflow_id = %workflow_id,
                task_queue = %queue,
                "Workflow id reservation rejected"
            );
            return Err(WorkflowError::AlreadyStarted {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
                task_queue: queue.clone(),
            });
        }

        let run_id = RunId::generate();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        runs.push(ExecutionRef {
            key: ExecutionKey::new(workflow_id.clone(), run_id.clone()),
            workflow_type: workflow_type.clone(),
            task_queue: queue.clone(),
            status: WorkflowStatus::Running,
            sequence,
        });

        let queues = self.queues_by_id.entry(workflow_id.clone()).or_default();
        if !queues.contains(queue) {
            queues.push(queue.clone());
        }

        tracing::debug!(workflow_id = %workflow_id, run_id = %run_id, "Workflow id reserved");
        Ok(run_id)
    }

    /// Register a run rebuilt from storage, bypassing reuse checks
    pub fn restore(
        &mut self,
        key: ExecutionKey,
        workflow_type: WorkflowType,
        task_queue: TaskQueueName,
        status: WorkflowStatus,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let queues = self.queues_by_id.entry(key.workflow_id.clone()).or_default();
        if !queues.contains(&task_queue) {
            queues.push(task_queue.clone());
        }
        self.runs
            .entry((task_queue.clone(), key.workflow_id.clone()))
            .or_default()
            .push(ExecutionRef {
                key,
                workflow_type,
                task_queue,
                status,
                sequence,
            });
    }

    /// Mark a run closed, freeing its id
    pub fn close(&mut self, key: &ExecutionKey, status: WorkflowStatus) -> WorkflowResult<()> {
        let run = self
            .find_mut(key)
            .ok_or_else(|| WorkflowError::RunNotFound(key.run_id.clone()))?;
        run.status = status;
        tracing::debug!(execution = %key, status = %status, "Workflow id released");
        Ok(())
    }

    /// The running run of `workflow_id` on any queue, otherwise its most recent one
    pub fn lookup(&self, workflow_id: &WorkflowId) -> WorkflowResult<&ExecutionRef> {
        let queues = self
            .queues_by_id
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(workflow_id.clone()))?;
        let candidates = queues.iter().filter_map(|q| {
            self.runs
                .get(&(q.clone(), workflow_id.clone()))
                .and_then(|runs| runs.last())
        });
        candidates
            .max_by_key(|r| (r.is_running(), r.sequence))
            .ok_or_else(|| WorkflowError::ExecutionNotFound(workflow_id.clone()))
    }

    /// The most recent run of `workflow_id` on `queue`
    pub fn lookup_in(
        &self,
        queue: &TaskQueueName,
        workflow_id: &WorkflowId,
    ) -> WorkflowResult<&ExecutionRef> {
        self.runs
            .get(&(queue.clone(), workflow_id.clone()))
            .and_then(|runs| runs.last())
            .ok_or_else(|| WorkflowError::ExecutionNotFound(workflow_id.clone()))
    }

    /// A specific run
    pub fn get(&self, key: &ExecutionKey) -> Option<&ExecutionRef> {
        self.queues_by_id.get(&key.workflow_id).and_then(|queues| {
            queues.iter().find_map(|q| {
                self.runs
                    .get(&(q.clone(), key.workflow_id.clone()))
                    .and_then(|runs| runs.iter().find(|r| &r.key == key))
            })
        })
    }

    /// Number of running executions
    pub fn running_count(&self) -> usize {
        self.runs
            .values()
            .filter_map(|runs| runs.last())
            .filter(|r| r.is_running())
            .count()
    }

    fn find_mut(&mut self, key: &ExecutionKey) -> Option<&mut ExecutionRef> {
        let queue = self.queues_by_id.get(&key.workflow_id)?.iter().find(|q| {
            self.runs
                .get(&((*q).clone(), key.workflow_id.clone()))
                .is_some_and(|runs| runs.iter().any(|r| &r.key == key))
        })?;
        let slot = (queue.clone(), key.workflow_id.clone());
        self.runs
            .get_mut(&slot)?
            .iter_mut()
            .find(|r| &r.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue() -> TaskQueueName {
        TaskQueueName::new("HelloChildTaskQueue")
    }

    fn reserve(registry: &mut WorkflowRegistry, id: &str) -> WorkflowResult<RunId> {
        registry.reserve(
            &queue(),
            &WorkflowId::new(id),
            &WorkflowType::new("GreetingChild"),
            WorkflowIdReusePolicy::AllowDuplicate,
        )
    }

    #[test]
    fn test_second_reservation_of_running_id_fails() {
        let mut registry = WorkflowRegistry::new();
        reserve(&mut registry, "my_child_workflowId").unwrap();
        let err = reserve(&mut registry, "my_child_workflowId").unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyStarted { .. }));
        assert_eq!(registry.running_count(), 1);
    }

    #[test]
    fn test_close_frees_id() {
        let mut registry = WorkflowRegistry::new();
        let run = reserve(&mut registry, "w").unwrap();
        let key = ExecutionKey::new(WorkflowId::new("w"), run);
        registry.close(&key, WorkflowStatus::Completed).unwrap();

        let second = reserve(&mut registry, "w").unwrap();
        assert_ne!(second, key.run_id);
        assert_eq!(registry.lookup(&WorkflowId::new("w")).unwrap().key.run_id, second);
    }

    #[test]
    fn test_same_id_on_different_queues() {
        let mut registry = WorkflowRegistry::new();
        let id = WorkflowId::new("w");
        let wf_type = WorkflowType::new("T");
        registry
            .reserve(&TaskQueueName::new("a"), &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        registry
            .reserve(&TaskQueueName::new("b"), &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        assert_eq!(registry.running_count(), 2);
        assert!(registry.lookup_in(&TaskQueueName::new("b"), &id).is_ok());
    }

    #[test]
    fn test_reject_duplicate_policy() {
        let mut registry = WorkflowRegistry::new();
        let id = WorkflowId::new("w");
        let wf_type = WorkflowType::new("T");
        let run = registry
            .reserve(&queue(), &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        registry
            .close(&ExecutionKey::new(id.clone(), run), WorkflowStatus::Failed)
            .unwrap();

        assert!(registry
            .reserve(&queue(), &id, &wf_type, WorkflowIdReusePolicy::RejectDuplicate)
            .is_err());
        assert!(registry
            .reserve(&queue(), &id, &wf_type, WorkflowIdReusePolicy::AllowDuplicateFailedOnly)
            .is_ok());
    }

    #[test]
    fn test_lookup_prefers_running_run() {
        let mut registry = WorkflowRegistry::new();
        let id = WorkflowId::new("w");
        let wf_type = WorkflowType::new("T");
        let running = registry
            .reserve(&TaskQueueName::new("a"), &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        let later = registry
            .reserve(&TaskQueueName::new("b"), &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        registry
            .close(&ExecutionKey::new(id.clone(), later), WorkflowStatus::Completed)
            .unwrap();
        assert_eq!(registry.lookup(&id).unwrap().key.run_id, running);
    }

    #[test]
    fn test_close_run_on_second_queue() {
        let mut registry = WorkflowRegistry::new();
        let id = WorkflowId::new("w");
        let wf_type = WorkflowType::new("T");
        let (a, b) = (TaskQueueName::new("a"), TaskQueueName::new("b"));
        let first = registry
            .reserve(&a, &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        let second = registry
            .reserve(&b, &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();

        let key = ExecutionKey::new(id.clone(), second);
        registry.close(&key, WorkflowStatus::Failed).unwrap();
        assert_eq!(registry.get(&key).unwrap().status, WorkflowStatus::Failed);
        assert!(registry.lookup_in(&a, &id).unwrap().is_running());
        assert_eq!(registry.lookup_in(&a, &id).unwrap().key.run_id, first);

        let third = registry
            .reserve(&b, &id, &wf_type, WorkflowIdReusePolicy::default())
            .unwrap();
        assert_eq!(registry.lookup_in(&b, &id).unwrap().key.run_id, third);
        assert!(matches!(
            registry.close(&ExecutionKey::new(id, RunId::new("missing")), WorkflowStatus::Completed),
            Err(WorkflowError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_id() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.lookup(&WorkflowId::new("missing")),
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }

    proptest! {
        /// Whatever the interleaving of starts and closes, an id never has
        /// two running runs on the same queue.
        #[test]
        fn at_most_one_running_run_per_id(ops in proptest::collection::vec((0u8..4, any::<bool>()), 1..64)) {
            let mut registry = WorkflowRegistry::new();
            let mut running: HashMap<u8, ExecutionKey> = HashMap::new();
            for (id, start) in ops {
                let workflow_id = WorkflowId::new(format!("w{}", id));
                if start {
                    let result = registry.reserve(
                        &queue(),
                        &workflow_id,
                        &WorkflowType::new("T"),
                        WorkflowIdReusePolicy::AllowDuplicate,
                    );
                    prop_assert_eq!(result.is_ok(), !running.contains_key(&id));
                    if let Ok(run) = result {
                        running.insert(id, ExecutionKey::new(workflow_id, run));
                    }
                } else if let Some(key) = running.remove(&id) {
                    registry.close(&key, WorkflowStatus::Completed).unwrap();
                }
                prop_assert_eq!(registry.running_count(), running.len());
            }
        }
    }
}
