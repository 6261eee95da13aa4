//! Retry policy for failed steps.
//!
//! Stateless: the orchestrator tracks attempts per step and asks the policy
//! whether another attempt is allowed, how long to wait, and where to resume.

use std::time::Duration;

use kanflow_types::config::MAX_RETRY_DELAY_MS;
use kanflow_types::workflow::{OnFailPolicy, WorkflowStep};

use super::step_executor::StepError;

/// Resolved `on_fail` policy for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
    /// Step to resume from.
    pub retry_step: String,
}

impl RetryPolicy {
    /// The policy for a step, if it declares `on_fail`.
    pub fn for_step(step: &WorkflowStep) -> Option<Self> {
        step.on_fail.as_ref().map(|policy| Self::from_policy(&step.id, policy))
    }

    fn from_policy(step_id: &str, policy: &OnFailPolicy) -> Self {
        let delay_ms = policy.retry_delay_ms.unwrap_or(0).min(MAX_RETRY_DELAY_MS);
        Self {
            max_retries: policy.max_retries,
            delay: Duration::from_millis(delay_ms),
            retry_step: policy
                .retry_step
                .clone()
                .unwrap_or_else(|| step_id.to_string()),
        }
    }

    /// Whether a failure after `attempts` executions may be retried.
    ///
    /// `attempts` counts every execution so far, the first one included.
    pub fn should_retry(&self, attempts: u32, error: &StepError) -> bool {
        error.is_retryable() && attempts <= self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(on_fail: &str) -> WorkflowStep {
        serde_yaml_ng::from_str(&format!(
            "id: implement\ntype: agent\nagent: dev\n{on_fail}"
        ))
        .unwrap()
    }

    fn criterion_failure() -> StepError {
        StepError::CriterionFailed {
            step_id: "implement".into(),
            criterion: "STATUS: done".into(),
        }
    }

    #[test]
    fn test_no_policy_without_on_fail() {
        assert!(RetryPolicy::for_step(&step("")).is_none());
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::for_step(&step("on_fail: {}\n")).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.delay, Duration::ZERO);
        assert_eq!(policy.retry_step, "implement");
    }

    #[test]
    fn test_delay_clamped_to_five_minutes() {
        let policy = RetryPolicy::for_step(&step(
            "on_fail:\n  retry_step: plan\n  retry_delay_ms: 9999999\n",
        ))
        .unwrap();
        assert_eq!(policy.delay, Duration::from_secs(300));
        assert_eq!(policy.retry_step, "plan");
    }

    #[test]
    fn test_should_retry_within_limit() {
        let policy = RetryPolicy::for_step(&step("on_fail:\n  max_retries: 2\n")).unwrap();
        let err = criterion_failure();
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn test_non_retryable_errors_are_not_retried() {
        let policy = RetryPolicy::for_step(&step("on_fail:\n  max_retries: 5\n")).unwrap();
        let limit = StepError::ResourceLimit {
            step_id: "implement".into(),
            message: "too many".into(),
        };
        let escalation = StepError::EscalationRequired {
            step_id: "implement".into(),
            message: "review".into(),
        };
        assert!(!policy.should_retry(1, &limit));
        assert!(!policy.should_retry(1, &escalation));
    }
}
