//! Retry backoff policy.

use std::time::Duration;

use thiserror::Error;

/// Rejected retry policy parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("max_attempts must be greater than zero")]
    ZeroAttempts,

    #[error("backoff multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
}

/// Immutable geometric backoff configuration.
///
/// `delay(attempt) = min(initial_delay * multiplier^(attempt - 1), max_delay)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(backoff_multiplier));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            max_delay,
        })
    }

    /// Start from the default policy.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let scaled = self.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        // Multiplying by exactly 1.0 must not drift through float rounding.
        if factor == 1.0 {
            return self.initial_delay.min(self.max_delay);
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Sum of every delay the policy can impose.
    pub fn total_delay_budget(&self) -> Duration {
        (1..self.max_attempts).map(|attempt| self.delay(attempt)).sum()
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.policy.max_attempts = value;
        self
    }

    pub fn initial_delay(mut self, value: Duration) -> Self {
        self.policy.initial_delay = value;
        self
    }

    pub fn backoff_multiplier(mut self, value: f64) -> Self {
        self.policy.backoff_multiplier = value;
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.policy.max_delay = value;
        self
    }

    /// Validate and build the policy.
    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        let p = self.policy;
        RetryPolicy::new(p.max_attempts, p.initial_delay, p.backoff_multiplier, p.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(7), Duration::from_millis(5000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(5000));
        assert_eq!(policy.total_delay_budget(), Duration::from_millis(300));
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            RetryPolicy::builder().max_attempts(0).build(),
            Err(PolicyError::ZeroAttempts)
        );
        assert!(matches!(
            RetryPolicy::builder().backoff_multiplier(0.5).build(),
            Err(PolicyError::InvalidMultiplier(_))
        ));
        assert!(RetryPolicy::builder()
            .backoff_multiplier(f64::NAN)
            .build()
            .is_err());
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(30))
            .backoff_multiplier(1.0)
            .build()
            .unwrap();
        assert_eq!(policy.delay(1), Duration::from_millis(30));
        assert_eq!(policy.delay(50), Duration::from_millis(30));
    }

    #[test]
    fn test_initial_delay_above_cap() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(
            initial_ms in 0u64..10_000,
            multiplier in 1.0f64..4.0,
            max_ms in 0u64..60_000,
            attempt in 1u32..40,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .backoff_multiplier(multiplier)
                .max_delay(Duration::from_millis(max_ms))
                .build()
                .unwrap();

            let expected = (initial_ms as f64 * multiplier.powi(attempt as i32 - 1))
                .min(max_ms as f64);
            let actual = policy.delay(attempt).as_secs_f64() * 1000.0;
            prop_assert!((actual - expected).abs() < 1e-3 * expected.max(1.0));
            prop_assert!(policy.delay(attempt) <= Duration::from_millis(max_ms));
        }

        #[test]
        fn prop_delay_is_monotonic(
            initial_ms in 1u64..1_000,
            multiplier in 1.0f64..3.0,
            attempt in 1u32..30,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .backoff_multiplier(multiplier)
                .max_delay(Duration::from_secs(30))
                .build()
                .unwrap();
            prop_assert!(policy.delay(attempt) <= policy.delay(attempt + 1));
        }
    }
}
