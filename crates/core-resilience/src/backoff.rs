//! Backoff policies for transient failures
//!
//! A [`BackoffPolicy`] answers two questions for a retry loop: may the
//! `n`-th retry happen at all, and how long should the caller wait before
//! making it. The policy is pure arithmetic; the waiting itself goes through
//! a [`Clock`](crate::clock::Clock) so tests never sleep for real.
//!
//! # Example
//!
//! ```
//! use stratus_core_resilience::backoff::{BackoffPolicy, BackoffStrategy};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy {
//!     max_retries: 4,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(5),
//!     strategy: BackoffStrategy::Exponential,
//!     jitter_factor: 0.0,
//! };
//!
//! assert_eq!(policy.delay_for(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(3), Duration::from_millis(400));
//! assert!(policy.allows(4));
//! assert!(!policy.allows(5));
//! ```

use rand::Rng;
use std::time::Duration;

/// How the delay grows between successive retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,

    /// Delay grows by `initial_delay` each retry
    Linear,

    /// Delay doubles each retry (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    ExponentialWithJitter,
}

/// Bounded backoff policy
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on the computed delay (before jitter)
    pub max_delay: Duration,

    /// Growth strategy
    pub strategy: BackoffStrategy,

    /// Jitter factor (0.0-1.0), only used by `ExponentialWithJitter`
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            strategy: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// A policy with no delay between retries, mostly useful in tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    /// Whether the `retry`-th retry (1-based) is within budget
    pub fn allows(&self, retry: u32) -> bool {
        retry >= 1 && retry <= self.max_retries
    }

    /// Delay to wait before the `retry`-th retry (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);

        let base_delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self
                .initial_delay
                .checked_mul(retry)
                .unwrap_or(self.max_delay),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                2_u32
                    .checked_pow(retry - 1)
                    .and_then(|multiplier| self.initial_delay.checked_mul(multiplier))
                    .unwrap_or(self.max_delay)
            }
        };

        let capped_delay = base_delay.min(self.max_delay);

        if self.strategy == BackoffStrategy::ExponentialWithJitter && self.jitter_factor > 0.0 {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor.min(1.0));
            capped_delay + Duration::from_secs_f64(capped_delay.as_secs_f64() * jitter)
        } else {
            capped_delay
        }
    }
}
