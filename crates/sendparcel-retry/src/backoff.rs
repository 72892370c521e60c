//! Exponential backoff for callback retries.
//!
//! A record that has failed `attempt` times becomes eligible again at
//! `now + base * 2^(attempt - 1)`. There is no jitter and no ceiling other
//! than saturation: the exponent is capped and the final timestamp clamps to
//! the latest representable instant instead of overflowing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Largest exponent applied; beyond this the delay is already decades long.
const MAX_EXPONENT: u32 = 20;

/// Default number of attempts before a record is exhausted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay in seconds.
pub const DEFAULT_BACKOFF_SECONDS: u64 = 60;

/// Computes when a record that has failed `attempt` times may run again.
///
/// `attempt` is 1-based; `0` is treated as `1` so a freshly enqueued record
/// waits exactly one base interval.
pub fn compute_next_retry_at(
    now: DateTime<Utc>,
    attempt: u32,
    backoff_seconds: u64,
) -> DateTime<Utc> {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    let multiplier = 2_u64.saturating_pow(exponent);
    let delay_seconds = backoff_seconds.saturating_mul(multiplier);

    let delay = i64::try_from(delay_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);

    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry behaviour shared by the dispatcher and the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether transient failures are queued for retry at all.
    pub enabled: bool,

    /// Attempts allowed before a record is exhausted, counting the replay
    /// that exhausts it.
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    pub backoff_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_seconds: DEFAULT_BACKOFF_SECONDS,
        }
    }
}

impl RetryPolicy {
    /// Next eligible time after `attempt` failures.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        compute_next_retry_at(now, attempt, self.backoff_seconds)
    }

    /// Returns true if one more failure on a record that has already failed
    /// `attempts` times uses up the budget.
    pub fn is_exhausted_after(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn first_attempt_waits_one_interval() {
        let next = compute_next_retry_at(epoch(), 1, 60);
        assert_eq!(next - epoch(), Duration::seconds(60));
    }

    #[test]
    fn zero_attempt_behaves_like_first() {
        assert_eq!(compute_next_retry_at(epoch(), 0, 60), compute_next_retry_at(epoch(), 1, 60));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let delays: Vec<i64> = (1..=5)
            .map(|attempt| (compute_next_retry_at(epoch(), attempt, 60) - epoch()).num_seconds())
            .collect();

        assert_eq!(delays, vec![60, 120, 240, 480, 960]);
    }

    #[test]
    fn zero_backoff_is_immediate() {
        assert_eq!(compute_next_retry_at(epoch(), 7, 0), epoch());
    }

    #[test]
    fn huge_inputs_saturate() {
        let next = compute_next_retry_at(epoch(), u32::MAX, u64::MAX);
        assert_eq!(next, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn exponent_is_capped() {
        assert_eq!(compute_next_retry_at(epoch(), 21, 1), compute_next_retry_at(epoch(), 500, 1));
    }

    #[test]
    fn exhaustion_counts_the_current_failure() {
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };

        assert!(!policy.is_exhausted_after(0));
        assert!(!policy.is_exhausted_after(1));
        assert!(policy.is_exhausted_after(2));
        assert!(policy.is_exhausted_after(3));
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_seconds, 60);
    }
}
