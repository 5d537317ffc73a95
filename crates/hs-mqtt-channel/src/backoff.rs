//! Reconnect backoff policy.
//!
//! Exponential: starts at `min`, doubles on each consecutive failure,
//! capped at `max`. A session that stays up for `stable_threshold`
//! resets the delay to `min`.

use std::time::Duration;

use crate::error::{MqttError, MqttResult};

/// Immutable backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub stable_threshold: Duration,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration, stable_threshold: Duration) -> MqttResult<Self> {
        if min.is_zero() {
            return Err(MqttError::Config(
                "reconnect min backoff must be greater than zero".into(),
            ));
        }
        if min > max {
            return Err(MqttError::Config(format!(
                "reconnect min backoff ({min:?}) exceeds max backoff ({max:?})"
            )));
        }
        Ok(Self {
            min,
            max,
            stable_threshold,
        })
    }

    pub fn from_secs(min: u64, max: u64, stable_threshold: u64) -> MqttResult<Self> {
        Self::new(
            Duration::from_secs(min),
            Duration::from_secs(max),
            Duration::from_secs(stable_threshold),
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(32),
            stable_threshold: Duration::from_secs(20),
        }
    }
}

/// Mutable backoff state owned by the connection manager.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            next: policy.min,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delay the next reconnect attempt would wait, without consuming it.
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Delay before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay
            .checked_mul(2)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.policy.min;
    }

    /// Account for a session that lasted `connected_for`. Returns `true`
    /// when it was long enough to reset the backoff.
    pub fn record_session(&mut self, connected_for: Duration) -> bool {
        if connected_for >= self.policy.stable_threshold {
            self.reset();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(Duration::as_secs).collect()
    }

    #[test]
    fn doubles_then_caps() {
        let mut backoff = Backoff::new(BackoffPolicy::from_secs(1, 32, 20).unwrap());
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(secs(&delays), [1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn stable_session_resets_to_min() {
        let mut backoff = Backoff::new(BackoffPolicy::from_secs(1, 32, 20).unwrap());
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert_eq!(backoff.peek(), Duration::from_secs(16));

        assert!(!backoff.record_session(Duration::from_secs(19)));
        assert_eq!(backoff.peek(), Duration::from_secs(16));

        assert!(backoff.record_session(Duration::from_secs(20)));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn min_equal_to_max_is_constant() {
        let mut backoff = Backoff::new(BackoffPolicy::from_secs(5, 5, 0).unwrap());
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = BackoffPolicy::from_secs(10, 2, 20).unwrap_err();
        assert!(matches!(err, MqttError::Config(_)));
    }

    #[test]
    fn rejects_zero_min() {
        assert!(BackoffPolicy::from_secs(0, 2, 20).is_err());
    }

    #[test]
    fn huge_max_does_not_overflow() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(1), Duration::MAX, Duration::ZERO).unwrap();
        let mut backoff = Backoff::new(policy);
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::MAX);
        }
    }

    proptest! {
        #[test]
        fn delays_non_decreasing_and_bounded(
            min in 1u64..600,
            extra in 0u64..3600,
            attempts in 1usize..64,
        ) {
            let max = min + extra;
            let mut backoff = Backoff::new(BackoffPolicy::from_secs(min, max, 20).unwrap());
            let mut previous = Duration::ZERO;
            for _ in 0..attempts {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_secs(max));
                previous = delay;
            }
        }
    }
}
