//! Retry delay calculation.

use std::time::Duration;

use super::request::BackoffPolicy;
use crate::util::clock::duration_ms;

/// Upper bound on any retry delay unless configured otherwise.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60 * 60);

/// Maps (policy, base delay, attempt) to a retry delay, clamped to a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffCalculator {
    ceiling: Duration,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_CEILING)
    }
}

impl BackoffCalculator {
    /// Create a calculator that never returns more than `ceiling`.
    #[must_use]
    pub const fn new(ceiling: Duration) -> Self {
        Self { ceiling }
    }

    /// The configured ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before retry number `attempt` (1 for the first retry).
    ///
    /// - linear: `base * attempt`
    /// - exponential: `base * 2^attempt`
    ///
    /// Arithmetic saturates, so arbitrarily long retry chains settle at the
    /// ceiling.
    #[must_use]
    pub fn calculate_delay(&self, policy: BackoffPolicy, base: Duration, attempt: u32) -> Duration {
        let base_ms = duration_ms(base);
        let raw_ms = match policy {
            BackoffPolicy::Linear => base_ms.saturating_mul(u64::from(attempt)),
            BackoffPolicy::Exponential => 1u64
                .checked_shl(attempt)
                .and_then(|factor| base_ms.checked_mul(factor))
                .unwrap_or(u64::MAX),
        };
        Duration::from_millis(raw_ms.min(duration_ms(self.ceiling)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_ceiling() {
        let calc = BackoffCalculator::new(Duration::from_secs(3600));
        let base = Duration::from_secs(10);
        for attempt in 1..=10u32 {
            let expected = (10u64 << attempt).min(3600);
            assert_eq!(
                calc.calculate_delay(BackoffPolicy::Exponential, base, attempt),
                Duration::from_secs(expected),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn linear_grows_by_base() {
        let calc = BackoffCalculator::default();
        let base = Duration::from_secs(30);
        assert_eq!(
            calc.calculate_delay(BackoffPolicy::Linear, base, 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            calc.calculate_delay(BackoffPolicy::Linear, base, 4),
            Duration::from_secs(120)
        );
        assert_eq!(
            calc.calculate_delay(BackoffPolicy::Linear, base, 1_000),
            DEFAULT_BACKOFF_CEILING
        );
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let calc = BackoffCalculator::default();
        for attempt in [63, 64, 200, u32::MAX] {
            assert_eq!(
                calc.calculate_delay(BackoffPolicy::Exponential, Duration::from_secs(30), attempt),
                DEFAULT_BACKOFF_CEILING
            );
        }
    }
}
