//! Task runner contract and bounded retry
//!
//! The engine only needs `submit(unit, payload)` that eventually yields a
//! [`TaskOutcome`]. A unit that ran and failed is an `Ok(TaskOutcome::Failed)`;
//! an `Err` means the runner itself could not be used.
//!
//! [`RetryingTaskRunner`] wraps a single-attempt runner and retries both kinds
//! of failure with exponential backoff, so callers see at most one failure per
//! submission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskRunnerError;

/// Final outcome of one unit submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The unit succeeded with this output
    Completed(Value),
    /// The unit failed with this message
    Failed(String),
}

impl TaskOutcome {
    /// Whether the unit succeeded
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Executes named units of work on behalf of the engine.
///
/// Implementations must be safe to call concurrently for unrelated
/// submissions.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Submit a unit and wait for its outcome
    async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError>;
}

#[async_trait]
impl<T: TaskRunner + ?Sized> TaskRunner for Arc<T> {
    async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
        (**self).submit(unit, payload).await
    }
}

/// Retry schedule for one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub min_timeout_ms: u64,
    /// Upper bound for any delay
    pub max_timeout_ms: u64,
    /// Growth factor between consecutive delays
    pub factor: f64,
    /// Apply ±20% jitter to each delay
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_timeout_ms: 1000,
            max_timeout_ms: 10_000,
            factor: 2.0,
            randomize: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy that retries immediately (tests, local runners)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_timeout_ms: 0,
            max_timeout_ms: 0,
            factor: 1.0,
            randomize: false,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = (self.min_timeout_ms as f64) * self.factor.powi(exponent);
        let capped = base.min(self.max_timeout_ms as f64).max(0.0);
        let ms = if self.randomize {
            // 0.8x to 1.2x
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            (capped * jitter).min(self.max_timeout_ms as f64)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }

    /// Check the policy for nonsensical values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("maxAttempts must be at least 1".to_string());
        }
        if !(self.factor >= 1.0) {
            return Err(format!("factor must be >= 1, got {}", self.factor));
        }
        if self.min_timeout_ms > self.max_timeout_ms {
            return Err(format!(
                "minTimeoutInMs ({}) exceeds maxTimeoutInMs ({})",
                self.min_timeout_ms, self.max_timeout_ms
            ));
        }
        Ok(())
    }
}

/// A task runner that retries each submission according to a per-unit policy
pub struct RetryingTaskRunner<R: TaskRunner> {
    inner: R,
    default_policy: RetryPolicy,
    unit_policies: HashMap<String, RetryPolicy>,
}

impl<R: TaskRunner> RetryingTaskRunner<R> {
    /// Wrap a runner with the default policy
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            default_policy: RetryPolicy::default(),
            unit_policies: HashMap::new(),
        }
    }

    /// Set the policy used for units without an override
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Override the policy for one unit
    pub fn with_unit_policy(mut self, unit: impl Into<String>, policy: RetryPolicy) -> Self {
        self.unit_policies.insert(unit.into(), policy);
        self
    }

    /// Policy that applies to a unit
    pub fn policy_for(&self, unit: &str) -> &RetryPolicy {
        self.unit_policies.get(unit).unwrap_or(&self.default_policy)
    }
}

#[async_trait]
impl<R: TaskRunner> TaskRunner for RetryingTaskRunner<R> {
    async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
        let policy = self.policy_for(unit);
        let max_attempts = policy.max_attempts.max(1);

        let mut last = None;
        for attempt in 1..=max_attempts {
            let outcome = self.inner.submit(unit, payload.clone()).await;
            let failure = match &outcome {
                Ok(TaskOutcome::Completed(_)) => return outcome,
                Ok(TaskOutcome::Failed(msg)) => msg.clone(),
                Err(e) => e.to_string(),
            };
            last = Some(outcome);

            if attempt < max_attempts {
                let backoff = policy.backoff(attempt);
                log::warn!(
                    "Unit '{}' attempt {}/{} failed: {} (retrying in {}ms)",
                    unit,
                    attempt,
                    max_attempts,
                    failure,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            } else {
                log::warn!(
                    "Unit '{}' failed after {} attempt(s): {}",
                    unit,
                    max_attempts,
                    failure
                );
            }
        }

        last.unwrap_or_else(|| Ok(TaskOutcome::Failed(format!("unit '{}' was never attempted", unit))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds
    struct FlakyRunner {
        failures: u32,
        unreachable: bool,
        calls: AtomicU32,
    }

    impl FlakyRunner {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                unreachable: false,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if self.unreachable {
                    return Err(TaskRunnerError::Unreachable("connection refused".into()));
                }
                return Ok(TaskOutcome::Failed(format!("{} attempt {} failed", unit, call)));
            }
            Ok(TaskOutcome::Completed(json!({"echo": payload})))
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let runner = RetryingTaskRunner::new(FlakyRunner::new(2))
            .with_default_policy(RetryPolicy::immediate(3));

        let outcome = runner.submit("crop", json!({"x": 1})).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(json!({"echo": {"x": 1}})));
        assert_eq!(runner.inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_failure() {
        let runner = RetryingTaskRunner::new(FlakyRunner::new(5))
            .with_default_policy(RetryPolicy::immediate(3));

        let outcome = runner.submit("crop", json!({})).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed("crop attempt 3 failed".into()));
        assert_eq!(runner.inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_unit_override() {
        let runner = RetryingTaskRunner::new(FlakyRunner::new(1))
            .with_default_policy(RetryPolicy::immediate(3))
            .with_unit_policy("llm-generate", RetryPolicy::immediate(1));

        let outcome = runner.submit("llm-generate", json!({})).await.unwrap();
        assert!(!outcome.is_completed());
        assert_eq!(runner.inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_propagates_after_retries() {
        let mut flaky = FlakyRunner::new(10);
        flaky.unreachable = true;
        let runner = RetryingTaskRunner::new(flaky).with_default_policy(RetryPolicy::immediate(2));

        let err = runner.submit("crop", json!({})).await.unwrap_err();
        assert!(matches!(err, TaskRunnerError::Unreachable(_)));
        assert_eq!(runner.inner.calls(), 2);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            randomize: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(10), Duration::from_millis(10_000));

        let jittered = RetryPolicy::default().backoff(1);
        assert!(jittered >= Duration::from_millis(800) && jittered <= Duration::from_millis(1200));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { factor: 0.5, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { min_timeout_ms: 20_000, ..RetryPolicy::default() }.validate().is_err());
    }
}
