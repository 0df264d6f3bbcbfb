//! Exponential backoff between step retries.

use std::time::Duration;

use switchyard_config::BackoffSection;

/// Delay schedule for retrying a failed step.
///
/// Retry `n` (1-based) waits `initial * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSection::default())
    }
}

impl From<&BackoffSection> for BackoffPolicy {
    fn from(section: &BackoffSection) -> Self {
        Self {
            initial: Duration::from_millis(section.initial_ms),
            max: Duration::from_millis(section.max_ms),
            multiplier: section.multiplier,
        }
    }
}

impl BackoffPolicy {
    /// A fixed delay, mostly useful in tests.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial.as_millis() as f64 * factor;
        let capped = millis.min(self.max.as_millis() as f64);
        if !capped.is_finite() {
            return self.max;
        }
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_doubles_each_retry() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_capped_at_max() {
        let policy = policy();
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_fixed() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(5));
        assert_eq!(policy.delay(1), policy.delay(10));
    }

    #[test]
    fn test_from_config_section() {
        let policy = BackoffPolicy::from(&BackoffSection::default());
        assert_eq!(policy.initial, Duration::from_millis(250));
        assert_eq!(policy.max, Duration::from_secs(30));
    }
}
