//! Activity dispatcher: attempt bookkeeping, timeouts and retry decisions
//!
//! The dispatcher owns every in-flight activity invocation. It does NOT run
//! activities or arm timers; it returns decisions for the engine to act on.
//! Each (invocation, attempt) pair accepts exactly one result: whichever of
//! completion, failure or timeout arrives first wins and the rest are stale.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use workflow_types::*;

/// How an attempt ended and what happens next
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptResolution {
    pub invocation: ActivityInvocationId,
    pub activity_type: ActivityType,
    /// The attempt that ended
    pub attempt: u32,
    pub outcome: ResolutionOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolutionOutcome {
    /// Final success
    Completed(Payload),
    /// Another attempt follows after `backoff`
    Retry {
        next_attempt: u32,
        backoff: Duration,
        failure: Failure,
    },
    /// Final failure, already wrapped as an activity failure
    Failed(Failure),
}

impl AttemptResolution {
    pub fn is_final(&self) -> bool {
        !matches!(self.outcome, ResolutionOutcome::Retry { .. })
    }
}

/// Tracks activity invocations from scheduling to their final result
#[derive(Clone, Debug)]
pub struct ActivityDispatcher {
    invocations: HashMap<ActivityInvocationId, ActivityInvocation>,
    /// Invocations waiting for their retry backoff to elapse
    backing_off: HashSet<ActivityInvocationId>,
    default_retry_policy: RetryPolicy,
}

impl ActivityDispatcher {
    pub fn new(default_retry_policy: RetryPolicy) -> Self {
        Self {
            invocations: HashMap::new(),
            backing_off: HashSet::new(),
            default_retry_policy,
        }
    }

    /// Create an invocation at attempt 1, ready to be dispatched.
    ///
    /// Scheduling an id that is already tracked returns the existing one.
    pub fn schedule(
        &mut self,
        id: ActivityInvocationId,
        activity_type: ActivityType,
        input: Payload,
        options: ActivityOptions,
        default_queue: &TaskQueueName,
    ) -> &ActivityInvocation {
        let retry_policy = options
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry_policy.clone());
        let task_queue = options
            .task_queue
            .clone()
            .unwrap_or_else(|| default_queue.clone());
        self.invocations.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(invocation = %id, activity_type = %activity_type, "Activity scheduled");
            ActivityInvocation::new(id, activity_type, input, options, retry_policy, task_queue)
        })
    }

    /// Mark `attempt` as started. Fails if that attempt is not the one waiting.
    pub fn start_attempt(
        &mut self,
        id: &ActivityInvocationId,
        attempt: u32,
    ) -> WorkflowResult<&ActivityInvocation> {
        let invocation = self
            .invocations
            .get_mut(id)
            .ok_or_else(|| WorkflowError::StaleTask(format!("activity {} is not pending", id)))?;
        if invocation.status != ActivityStatus::Scheduled
            || invocation.attempt != attempt
            || self.backing_off.contains(id)
        {
            return Err(WorkflowError::StaleTask(format!(
                "activity {} attempt {} is not startable (current attempt {}, {:?})",
                id, attempt, invocation.attempt, invocation.status
            )));
        }
        invocation.status = ActivityStatus::Started;
        invocation.started_at = Some(chrono::Utc::now());
        Ok(invocation)
    }

    /// Record the result reported by a worker. Returns `None` for stale reports.
    pub fn record_completion(
        &mut self,
        id: &ActivityInvocationId,
        attempt: u32,
        outcome: Result<Payload, Failure>,
    ) -> Option<AttemptResolution> {
        if !self.is_running_attempt(id, attempt) {
            tracing::debug!(invocation = %id, attempt, "Ignoring stale activity result");
            return None;
        }
        match outcome {
            Ok(result) => {
                let invocation = self.invocations.remove(id)?;
                Some(AttemptResolution {
                    invocation: invocation.id,
                    activity_type: invocation.activity_type,
                    attempt,
                    outcome: ResolutionOutcome::Completed(result),
                })
            }
            Err(failure) => self.resolve_failure(id, failure),
        }
    }

    /// The start-to-close timer of `attempt` elapsed
    pub fn record_timeout(&mut self, id: &ActivityInvocationId, attempt: u32) -> Option<AttemptResolution> {
        if !self.is_running_attempt(id, attempt) {
            return None;
        }
        self.resolve_failure(id, Failure::timeout(TimeoutType::StartToClose))
    }

    /// The schedule-to-close deadline elapsed; no further attempts are made
    pub fn record_deadline(&mut self, id: &ActivityInvocationId) -> Option<AttemptResolution> {
        let invocation = self.invocations.remove(id)?;
        self.backing_off.remove(id);
        let cause = Failure::timeout(TimeoutType::ScheduleToClose);
        Some(Self::final_failure(invocation, RetryState::Timeout, cause))
    }

    /// The backoff before `attempt` elapsed; returns the invocation to dispatch
    pub fn retry_ready(&mut self, id: &ActivityInvocationId, attempt: u32) -> Option<&ActivityInvocation> {
        let invocation = self.invocations.get(id)?;
        if invocation.attempt != attempt || !self.backing_off.remove(id) {
            return None;
        }
        Some(invocation)
    }

    /// Drop every invocation of a closed execution
    pub fn remove_for_execution(&mut self, key: &ExecutionKey) -> Vec<ActivityInvocationId> {
        let ids: Vec<_> = self
            .invocations
            .keys()
            .filter(|id| &id.execution == key)
            .cloned()
            .collect();
        for id in &ids {
            self.invocations.remove(id);
            self.backing_off.remove(id);
        }
        if !ids.is_empty() {
            tracing::debug!(execution = %key, count = ids.len(), "Activities abandoned");
        }
        ids
    }

    pub fn get(&self, id: &ActivityInvocationId) -> Option<&ActivityInvocation> {
        self.invocations.get(id)
    }

    /// Invocations of `key` that have not reached a final result
    pub fn pending_for(&self, key: &ExecutionKey) -> Vec<&ActivityInvocation> {
        self.invocations
            .values()
            .filter(|inv| &inv.id.execution == key)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.invocations.len()
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn is_running_attempt(&self, id: &ActivityInvocationId, attempt: u32) -> bool {
        self.invocations
            .get(id)
            .map(|inv| inv.status == ActivityStatus::Started && inv.attempt == attempt)
            .unwrap_or(false)
    }

    fn resolve_failure(&mut self, id: &ActivityInvocationId, failure: Failure) -> Option<AttemptResolution> {
        let invocation = self.invocations.get_mut(id)?;
        let attempt = invocation.attempt;
        invocation.last_failure = Some(failure.clone());

        let retry_state = if !invocation.retry_policy.is_retryable(&failure) {
            Some(RetryState::NonRetryableFailure)
        } else if !invocation.retry_policy.has_attempts_left(attempt) {
            Some(RetryState::MaximumAttemptsReached)
        } else {
            None
        };

        match retry_state {
            Some(state) => {
                let invocation = self.invocations.remove(id)?;
                Some(Self::final_failure(invocation, state, failure))
            }
            None => {
                let backoff = invocation.retry_policy.backoff_for(attempt);
                invocation.attempt += 1;
                invocation.status = ActivityStatus::Scheduled;
                invocation.started_at = None;
                let resolution = AttemptResolution {
                    invocation: invocation.id.clone(),
                    activity_type: invocation.activity_type.clone(),
                    attempt,
                    outcome: ResolutionOutcome::Retry {
                        next_attempt: invocation.attempt,
                        backoff,
                        failure,
                    },
                };
                self.backing_off.insert(id.clone());
                Some(resolution)
            }
        }
    }

    fn final_failure(
        mut invocation: ActivityInvocation,
        retry_state: RetryState,
        cause: Failure,
    ) -> AttemptResolution {
        invocation.status = if cause.is_timeout() {
            ActivityStatus::TimedOut
        } else {
            ActivityStatus::Failed
        };
        tracing::debug!(
            invocation = %invocation.id,
            attempt = invocation.attempt,
            status = ?invocation.status,
            retry_state = ?retry_state,
            "Activity failed permanently"
        );
        let wrapped = Failure::activity(
            invocation.activity_type.clone(),
            invocation.id.seq,
            invocation.attempt,
            retry_state,
            cause,
        );
        AttemptResolution {
            invocation: invocation.id,
            activity_type: invocation.activity_type,
            attempt: invocation.attempt,
            outcome: ResolutionOutcome::Failed(wrapped),
        }
    }
}

impl Default for ActivityDispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(seq: u64) -> ActivityInvocationId {
        ActivityInvocationId::new(
            ExecutionKey::new(WorkflowId::new("GreetingChild"), RunId::new("run-1")),
            seq,
        )
    }

    fn make_dispatcher(policy: RetryPolicy) -> (ActivityDispatcher, ActivityInvocationId) {
        let mut dispatcher = ActivityDispatcher::new(RetryPolicy::default());
        let id = make_id(1);
        dispatcher.schedule(
            id.clone(),
            ActivityType::new("getGreeting"),
            serde_json::json!(true),
            ActivityOptions::with_start_to_close(Duration::from_secs(2)).retry_policy(policy),
            &TaskQueueName::new("q"),
        );
        (dispatcher, id)
    }

    fn fast_policy(max: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_interval(Duration::from_millis(10))
            .with_maximum_attempts(max)
    }

    #[test]
    fn test_success_is_final() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(3));
        dispatcher.start_attempt(&id, 1).unwrap();
        let resolution = dispatcher
            .record_completion(&id, 1, Ok(serde_json::json!("")))
            .unwrap();
        assert_eq!(resolution.outcome, ResolutionOutcome::Completed(serde_json::json!("")));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_non_retryable_failure_stops_after_one_attempt() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(5));
        dispatcher.start_attempt(&id, 1).unwrap();
        let app = Failure::non_retryable("myException", "my exception");
        let resolution = dispatcher.record_completion(&id, 1, Err(app.clone())).unwrap();

        let ResolutionOutcome::Failed(failure) = resolution.outcome else {
            panic!("expected final failure");
        };
        assert!(matches!(
            failure.kind,
            FailureKind::Activity {
                attempt: 1,
                retry_state: RetryState::NonRetryableFailure,
                ..
            }
        ));
        assert_eq!(failure.cause(), Some(&app));
    }

    #[test]
    fn test_timeouts_retry_until_attempts_exhausted() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(3));
        for attempt in 1..=2 {
            dispatcher.start_attempt(&id, attempt).unwrap();
            let resolution = dispatcher.record_timeout(&id, attempt).unwrap();
            let ResolutionOutcome::Retry { next_attempt, .. } = resolution.outcome else {
                panic!("expected retry");
            };
            assert_eq!(next_attempt, attempt + 1);
            assert!(dispatcher.start_attempt(&id, next_attempt).is_err());
            assert!(dispatcher.retry_ready(&id, next_attempt).is_some());
        }

        dispatcher.start_attempt(&id, 3).unwrap();
        let resolution = dispatcher.record_timeout(&id, 3).unwrap();
        let ResolutionOutcome::Failed(failure) = resolution.outcome else {
            panic!("expected final failure");
        };
        assert!(matches!(
            failure.kind,
            FailureKind::Activity {
                attempt: 3,
                retry_state: RetryState::MaximumAttemptsReached,
                ..
            }
        ));
        assert!(failure.cause().unwrap().is_timeout());
    }

    #[test]
    fn test_late_result_after_timeout_is_stale() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(2));
        dispatcher.start_attempt(&id, 1).unwrap();
        assert!(dispatcher.record_timeout(&id, 1).is_some());
        assert!(dispatcher
            .record_completion(&id, 1, Ok(serde_json::json!("late")))
            .is_none());
        assert!(dispatcher.record_timeout(&id, 1).is_none());
    }

    #[test]
    fn test_listed_error_type_is_not_retried() {
        let policy = fast_policy(5).with_non_retryable("InvalidInput");
        let (mut dispatcher, id) = make_dispatcher(policy);
        dispatcher.start_attempt(&id, 1).unwrap();
        let resolution = dispatcher
            .record_completion(&id, 1, Err(Failure::application("InvalidInput", "bad")))
            .unwrap();
        assert!(resolution.is_final());
    }

    #[test]
    fn test_deadline_fails_pending_invocation() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(0));
        let resolution = dispatcher.record_deadline(&id).unwrap();
        let ResolutionOutcome::Failed(failure) = resolution.outcome else {
            panic!("expected final failure");
        };
        assert!(matches!(
            failure.cause().unwrap().kind,
            FailureKind::Timeout {
                timeout_type: TimeoutType::ScheduleToClose
            }
        ));
        assert!(dispatcher.record_deadline(&id).is_none());
    }

    #[test]
    fn test_remove_for_execution() {
        let (mut dispatcher, id) = make_dispatcher(fast_policy(0));
        assert_eq!(dispatcher.pending_for(&id.execution).len(), 1);
        assert_eq!(dispatcher.remove_for_execution(&id.execution), vec![id.clone()]);
        assert!(dispatcher.start_attempt(&id, 1).is_err());
    }
}
