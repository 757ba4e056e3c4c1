//! Retry policy arithmetic for workflow steps.
//!
//! Stateless: the caller tracks the attempt number (1-based, first
//! execution is attempt 1).

use std::time::Duration;

use taskflow_types::workflow::RetryPolicy;

pub struct RetryHandler;

impl RetryHandler {
    /// Total attempts permitted; 1 when the step has no policy.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map_or(1, |p| p.max_attempts.max(1))
    }

    /// Whether a failed `attempt` should be followed by another.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Delay after failed `attempt`:
    /// `min(initial_delay_ms * backoff_multiplier^(attempt - 1), max_delay_ms)`.
    pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_delay_ms as f64)
        } else {
            policy.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_delay_ms: 100,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn should_retry_until_max_attempts() {
        let p = policy();
        assert!(RetryHandler::should_retry(Some(&p), 1));
        assert!(RetryHandler::should_retry(Some(&p), 3));
        assert!(!RetryHandler::should_retry(Some(&p), 4));
    }

    #[test]
    fn no_policy_means_single_attempt() {
        assert_eq!(RetryHandler::max_attempts(None), 1);
        assert!(!RetryHandler::should_retry(None, 1));
    }

    #[test]
    fn exponential_backoff_capped() {
        let p = policy();
        let delays: Vec<u64> = (1..=5)
            .map(|a| RetryHandler::delay_for_attempt(&p, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = policy();
        assert_eq!(
            RetryHandler::delay_for_attempt(&p, u32::MAX),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn multiplier_of_one_is_fixed_delay() {
        let p = RetryPolicy {
            backoff_multiplier: 1.0,
            ..policy()
        };
        assert_eq!(RetryHandler::delay_for_attempt(&p, 3), Duration::from_millis(100));
    }
}
