//! Retry decisions and backoff delay computation for step attempts.

use std::time::Duration;

use stepflow_types::workflow::{BackoffStrategy, RetryPolicy};

/// Multiplier applied by exponential backoff when the policy sets none.
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Upper bound on any computed delay (one day). Keeps float results inside
/// `Duration` range regardless of policy values.
const MAX_DELAY_CAP_MS: f64 = 86_400_000.0;

/// Stateless retry handler for step failures.
///
/// No internal state; all logic lives in associated functions that take the
/// policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Delay to wait before retry number `retry_index` (0-based: index 0 is
    /// the wait between attempt 1 and attempt 2).
    ///
    /// - fixed: `initial`
    /// - linear: `initial + retry_index * multiplier` (multiplier defaults to `initial`)
    /// - exponential: `initial * multiplier^retry_index` (multiplier defaults to 2)
    ///
    /// Capped at `max_delay_ms` when set; never negative.
    pub fn backoff_delay(policy: &RetryPolicy, retry_index: u32) -> Duration {
        let initial = policy.initial_delay_ms as f64;
        let n = f64::from(retry_index);

        let raw = match policy.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial + n * policy.multiplier.unwrap_or(initial),
            BackoffStrategy::Exponential => {
                let factor = policy.multiplier.unwrap_or(DEFAULT_EXPONENTIAL_MULTIPLIER);
                initial * factor.powi(retry_index.min(i32::MAX as u32) as i32)
            }
        };

        let mut ms = if raw.is_finite() { raw.max(0.0) } else { MAX_DELAY_CAP_MS };
        if let Some(max) = policy.max_delay_ms {
            ms = ms.min(max as f64);
        }
        Duration::from_millis(ms.min(MAX_DELAY_CAP_MS).round() as u64)
    }

    /// Check a policy for values that cannot be applied.
    pub fn validate_policy(policy: &RetryPolicy) -> Result<(), String> {
        if policy.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if let Some(m) = policy.multiplier {
            if !m.is_finite() || m < 0.0 {
                return Err(format!("multiplier must be a non-negative number, got {m}"));
            }
        }
        Ok(())
    }
}
