//! Retry policy for transient handler failures.
//!
//! The default requeues immediately. A backoff policy doubles the delay per
//! attempt up to a cap, with up to 20% jitter so a flapping link does not
//! produce a tight retry loop.

use std::time::Duration;

use rand::Rng;

const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Backoff {
    base: Duration,
    max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: None,
        }
    }

    pub fn with_backoff(max_retries: u32, base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            max_retries,
            backoff: Some(Backoff {
                base,
                max: max.max(base),
            }),
        }
    }

    /// Whether a command that already retried `retries` times may run again.
    pub fn allows(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based). `None` means requeue now.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let backoff = self.backoff?;
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = backoff.base.saturating_mul(1 << exponent).min(backoff.max);
        Some(add_jitter(delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let jitter_ms_max = (delay.as_millis() as f64 * JITTER_RATIO) as u64;
    if jitter_ms_max == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_policy_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.next_delay(1), None);
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let policy =
            RetryPolicy::with_backoff(3, Duration::from_millis(100), Duration::from_millis(300));

        let first = policy.next_delay(1).unwrap();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));

        let second = policy.next_delay(2).unwrap();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(240));

        let capped = policy.next_delay(5).unwrap();
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(360));
    }
}
