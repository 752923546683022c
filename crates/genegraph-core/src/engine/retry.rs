//! Retry policy: attempt bound and exponential backoff.
//!
//! Stateless. The attempt history lives on the vertex; the policy only
//! answers whether another attempt is allowed and how long to wait for it.

use chrono::Duration;
use genegraph_types::config::BackoffConfig;
use genegraph_types::execution::Task;

/// Attempt bound and backoff schedule for one task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, at least 1.
    pub limit: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    /// Policy for `task`, falling back to `default_limit` when the task does
    /// not set `backoff_limit`. A limit of 0 is treated as 1.
    pub fn for_task(task: &Task, default_limit: u32, backoff: &BackoffConfig) -> Self {
        Self {
            limit: task.backoff_limit.unwrap_or(default_limit).max(1),
            backoff: backoff.clone(),
        }
    }

    /// Whether another attempt may follow `failures` failed attempts.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.limit
    }

    /// Delay before the attempt following the `failure`-th failure (1-based):
    /// `min(initial * multiplier^(failure-1), max)`.
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff.initial_secs as f64 * self.backoff.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.backoff.max_secs as f64).max(0.0);
        Duration::milliseconds((capped * 1000.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::command_task;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            initial_secs: 10,
            multiplier: 2.0,
            max_secs: 60,
        }
    }

    #[test]
    fn test_limit_falls_back_to_default() {
        let task = command_task("a", &[]);
        assert_eq!(RetryPolicy::for_task(&task, 3, &backoff()).limit, 3);

        let mut task = command_task("a", &[]);
        task.backoff_limit = Some(5);
        assert_eq!(RetryPolicy::for_task(&task, 3, &backoff()).limit, 5);
    }

    #[test]
    fn test_zero_limit_still_allows_one_attempt() {
        let mut task = command_task("a", &[]);
        task.backoff_limit = Some(0);
        let policy = RetryPolicy::for_task(&task, 3, &backoff());
        assert_eq!(policy.limit, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_should_retry_until_limit() {
        let policy = RetryPolicy {
            limit: 3,
            backoff: backoff(),
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            limit: 10,
            backoff: backoff(),
        };
        assert_eq!(policy.delay_for(1), Duration::seconds(10));
        assert_eq!(policy.delay_for(2), Duration::seconds(20));
        assert_eq!(policy.delay_for(3), Duration::seconds(40));
        assert_eq!(policy.delay_for(4), Duration::seconds(60));
        assert_eq!(policy.delay_for(40), Duration::seconds(60));
    }

    #[test]
    fn test_zero_initial_delay_retries_immediately() {
        let policy = RetryPolicy {
            limit: 2,
            backoff: BackoffConfig {
                initial_secs: 0,
                multiplier: 2.0,
                max_secs: 60,
            },
        };
        assert_eq!(policy.delay_for(1), Duration::zero());
    }
}
