// src/backoff.rs

//! Restart delays for failing nodes.
//!
//! The delay after the `n`-th consecutive failure (0-indexed) is
//! `first * factor^n`, capped at `max`, then jittered. The base is derived
//! from the failure count alone, so jitter never compounds.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Randomisation applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Exact delays.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl JitterPolicy {
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        if millis == 0 {
            return delay;
        }

        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=millis)),
            JitterPolicy::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.random_range(0..=millis - half))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// A policy that always waits `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before the next start after `failures` consecutive failures.
    ///
    /// `failures` counts the failure that just happened, so the first call
    /// after an error passes `1` and gets `first`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);
        let max_secs = self.max.as_secs_f64();

        let base = if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn grows_exponentially_then_caps() {
        let policy = exponential();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn zero_failures_uses_first() {
        assert_eq!(exponential().delay(0), Duration::from_millis(100));
    }

    #[test]
    fn fixed_policy_never_changes() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        for failures in 1..20 {
            assert_eq!(policy.delay(failures), Duration::from_millis(250));
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let full = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..exponential()
        };
        let equal = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..exponential()
        };
        for _ in 0..100 {
            assert!(full.delay(3) <= Duration::from_millis(400));
            let d = equal.delay(3);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }
}
