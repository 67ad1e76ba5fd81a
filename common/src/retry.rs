// Retry handling: periodic retry-after-failure decisions and requeue backoff with jitter

use crate::models::{ExecutionRecord, ExecutionState, RetryPolicy};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Maximum number of runs for one periodic lineage, whatever the policy says
pub const MAX_RETRIES: u32 = 10;

/// Runs allowed by a policy once the global cap is applied
pub fn effective_max_attempts(policy: &RetryPolicy) -> u32 {
    policy.max_attempts.min(MAX_RETRIES)
}

/// Outcome of evaluating a retry policy against the latest record of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start another run; the value is the retry counter to stamp on it
    Retry(u32),
    /// The previous run is still in progress and the policy does not run all
    InProgress,
    /// The lineage already used every allowed run
    Exhausted,
    /// The retry interval since the previous start has not elapsed yet
    TooSoon,
    /// The previous run succeeded and the policy retries only until success
    Succeeded,
    /// The retry counter label could not be parsed
    InvalidCounter,
}

impl RetryDecision {
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            RetryDecision::Retry(count) => Some(*count),
            _ => None,
        }
    }
}

/// Decide whether `latest` should be retried under `policy` at `now`
pub fn evaluate_retry(
    policy: &RetryPolicy,
    latest: &ExecutionRecord,
    now: DateTime<Utc>,
) -> RetryDecision {
    if !latest.is_complete() && !policy.run_all {
        return RetryDecision::InProgress;
    }

    let previous = match latest.retry_count() {
        Ok(count) => count,
        Err(e) => {
            warn!(
                record = %latest.key(),
                job = %latest.spec.job,
                error = %e,
                "Malformed retry counter label, not retrying"
            );
            return RetryDecision::InvalidCounter;
        }
    };

    let run_count = previous.saturating_add(1);
    if run_count > effective_max_attempts(policy) {
        return RetryDecision::Exhausted;
    }

    if now - latest.status.start_time <= policy.interval() {
        return RetryDecision::TooSoon;
    }

    if !policy.run_all && latest.status.state == ExecutionState::Success {
        return RetryDecision::Succeeded;
    }

    RetryDecision::Retry(run_count)
}

/// Exponential backoff with jitter for requeueing failed reconciliations
/// Sequence: base, base*3, base*9, ... capped at max_delay
/// Jitter: Random value added to prevent thundering herd
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Calculate exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> Duration {
        let factor = 3_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Add random jitter on top of the base delay
    fn add_jitter(&self, base: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return base;
        }

        let jitter_range_ms = (base.as_millis() as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base + Duration::from_millis(jitter_ms)
    }

    /// Delay before the next attempt after `attempt` consecutive failures
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.add_jitter(self.calculate_base_delay(attempt))
    }
}
