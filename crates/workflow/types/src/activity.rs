//! Activity invocations, options and retry policy

use crate::{ActivityInvocationId, ActivityType, Failure, Payload, TaskQueueName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options attached to one activity call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Maximum duration of a single attempt
    pub start_to_close_timeout: Duration,
    /// Overall deadline across all attempts, measured from scheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout: Option<Duration>,
    /// Retry policy; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Queue the activity task is routed to; the workflow's own queue when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<TaskQueueName>,
}

impl ActivityOptions {
    pub fn with_start_to_close(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            schedule_to_close_timeout: None,
            retry_policy: None,
            task_queue: None,
        }
    }

    pub fn schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn task_queue(mut self, queue: impl Into<TaskQueueName>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }
}

// ── Retry Policy ─────────────────────────────────────────────────────

/// Exponential backoff retry policy.
///
/// `maximum_attempts == 0` means unlimited attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    /// Application error types that are never retried
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_non_retryable(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(error_type.into());
        self
    }

    /// Delay before the attempt following `failed_attempt` (1-based).
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        const MAX_EXP: i32 = 30;
        let exp = i32::try_from(failed_attempt.saturating_sub(1)).map_or(MAX_EXP, |e| e.min(MAX_EXP));
        let coefficient = if self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0 {
            self.backoff_coefficient
        } else {
            1.0
        };
        let base = self.initial_interval.as_secs_f64() * coefficient.powi(exp);
        let capped = base.min(self.maximum_interval.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(self.maximum_interval)
    }

    /// Whether another attempt is allowed after `failed_attempt` attempts.
    pub fn has_attempts_left(&self, failed_attempt: u32) -> bool {
        self.maximum_attempts == 0 || failed_attempt < self.maximum_attempts
    }

    /// Whether `failure` may be retried under this policy.
    pub fn is_retryable(&self, failure: &Failure) -> bool {
        if failure.is_non_retryable() {
            return false;
        }
        match failure.error_type() {
            Some(error_type) => !self
                .non_retryable_error_types
                .iter()
                .any(|t| t == error_type),
            None => true,
        }
    }
}

// ── Invocation ───────────────────────────────────────────────────────

/// Lifecycle status of an activity invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    /// Waiting for a worker (or for its retry backoff to elapse)
    Scheduled,
    /// An attempt is running
    Started,
    Completed,
    Failed,
    TimedOut,
}

impl ActivityStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// One logical activity call made by a workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub id: ActivityInvocationId,
    pub activity_type: ActivityType,
    pub input: Payload,
    pub options: ActivityOptions,
    pub retry_policy: RetryPolicy,
    pub task_queue: TaskQueueName,
    /// Current attempt number, starting at 1
    pub attempt: u32,
    pub status: ActivityStatus,
    pub last_failure: Option<Failure>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ActivityInvocation {
    pub fn new(
        id: ActivityInvocationId,
        activity_type: ActivityType,
        input: Payload,
        options: ActivityOptions,
        retry_policy: RetryPolicy,
        task_queue: TaskQueueName,
    ) -> Self {
        Self {
            id,
            activity_type,
            input,
            options,
            retry_policy,
            task_queue,
            attempt: 1,
            status: ActivityStatus::Scheduled,
            last_failure: None,
            scheduled_at: Utc::now(),
            started_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_grows_exponentially_until_capped() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(100),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(500),
            maximum_attempts: 5,
            non_retryable_error_types: vec![],
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
    }

    #[test]
    fn attempts_are_bounded_unless_unlimited() {
        let bounded = RetryPolicy::default().with_maximum_attempts(3);
        assert!(bounded.has_attempts_left(2));
        assert!(!bounded.has_attempts_left(3));

        let unlimited = RetryPolicy::default();
        assert!(unlimited.has_attempts_left(10_000));
    }

    #[test]
    fn listed_error_types_are_not_retried() {
        let policy = RetryPolicy::default().with_non_retryable("InvalidAccount");
        assert!(!policy.is_retryable(&Failure::application("InvalidAccount", "no such account")));
        assert!(policy.is_retryable(&Failure::application("Transient", "try again")));
        assert!(!policy.is_retryable(&Failure::non_retryable("Transient", "give up")));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_maximum(
            initial_ms in 1u64..10_000,
            max_ms in 1u64..100_000,
            coefficient in 1.0f64..5.0,
            attempt in 1u32..200,
        ) {
            let policy = RetryPolicy {
                initial_interval: Duration::from_millis(initial_ms),
                backoff_coefficient: coefficient,
                maximum_interval: Duration::from_millis(max_ms),
                maximum_attempts: 0,
                non_retryable_error_types: vec![],
            };
            prop_assert!(policy.backoff_for(attempt) <= policy.maximum_interval);
        }

        #[test]
        fn backoff_is_monotonic(
            initial_ms in 1u64..1_000,
            coefficient in 1.0f64..3.0,
            attempt in 1u32..50,
        ) {
            let policy = RetryPolicy {
                initial_interval: Duration::from_millis(initial_ms),
                backoff_coefficient: coefficient,
                maximum_interval: Duration::from_secs(3600),
                maximum_attempts: 0,
                non_retryable_error_types: vec![],
            };
            prop_assert!(policy.backoff_for(attempt) <= policy.backoff_for(attempt + 1));
        }
    }
}
