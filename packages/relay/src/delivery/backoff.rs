// packages/relay/src/delivery/backoff.rs
//! Exponential retry backoff: `base * 2^attempt`, capped at `max`

use crate::utils::config::PipelineConfig;
use std::time::Duration;

/// Retry delay schedule for a failing batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_then_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(10));
        assert_eq!(policy.delay(64), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    proptest! {
        #[test]
        fn prop_strictly_increasing_until_cap(
            base_ms in 1u64..5_000,
            max_factor in 1u64..1_000,
            attempts in 1u32..40,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(base_ms * max_factor);
            let policy = BackoffPolicy::new(base, max);

            let mut capped = false;
            let mut previous = policy.delay(0);
            prop_assert_eq!(previous, base);

            for attempt in 1..attempts {
                let current = policy.delay(attempt);
                prop_assert!(current <= max);
                if capped {
                    prop_assert_eq!(current, max);
                } else if current == max {
                    prop_assert!(current >= previous);
                    capped = true;
                } else {
                    prop_assert!(current > previous);
                }
                previous = current;
            }
        }
    }
}
