//! Per-class backoff policies.
//!
//! Delay before retry `n` (0-based) is `min(base * 2^n, max)`, then scaled by
//! a uniform factor in `[1 - jitter, 1 + jitter]` so concurrent callers that
//! failed together don't retry together.
//!
//! # Example
//!
//! ```
//! use tts_cache::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::rate_limited();
//! assert_eq!(policy.max_retries, 3);
//! assert_eq!(policy.delay(0), Duration::from_secs(1));
//! assert_eq!(policy.delay(4), Duration::from_secs(16));
//! assert_eq!(policy.delay(10), Duration::from_secs(16));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorClassification;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    /// Clamped to `0.0..=1.0`
    pub jitter_fraction: f64,
}

impl BackoffPolicy {
    /// 429: back off hardest, the upstream asked us to.
    #[must_use]
    pub fn rate_limited() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_retries: 3,
            jitter_fraction: 0.25,
        }
    }

    #[must_use]
    pub fn server_error() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_retries: 2,
            jitter_fraction: 0.25,
        }
    }

    #[must_use]
    pub fn network_error() -> Self {
        Self::server_error()
    }

    /// Unclassified failures get a single retry.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            max_retries: 1,
            jitter_fraction: 0.25,
        }
    }

    /// Fast-fail for initial backend connections: 5 retries over ~3 seconds,
    /// so a wrong URL surfaces at startup instead of hanging.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_retries: 5,
            jitter_fraction: 0.1,
        }
    }

    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries: 0,
            jitter_fraction: 0.0,
        }
    }

    /// Pre-jitter delay before retry `attempt` (0-based). Never exceeds
    /// `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Inclusive range the jittered delay for `attempt` falls into.
    #[must_use]
    pub fn jitter_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let delay = self.delay(attempt).as_secs_f64();
        let j = self.jitter();
        (
            Duration::from_secs_f64(delay * (1.0 - j)),
            Duration::from_secs_f64(delay * (1.0 + j)),
        )
    }

    /// Delay for `attempt` with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let j = self.jitter();
        let delay = self.delay(attempt);
        if j == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - j)..=(1.0 + j));
        delay.mul_f64(factor)
    }

    fn jitter(&self) -> f64 {
        if self.jitter_fraction.is_nan() {
            0.0
        } else {
            self.jitter_fraction.clamp(0.0, 1.0)
        }
    }
}

/// One [`BackoffPolicy`] per retryable error class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub rate_limited: BackoffPolicy,
    pub server_error: BackoffPolicy,
    pub network_error: BackoffPolicy,
    pub unknown: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            rate_limited: BackoffPolicy::rate_limited(),
            server_error: BackoffPolicy::server_error(),
            network_error: BackoffPolicy::network_error(),
            unknown: BackoffPolicy::unknown(),
        }
    }
}

impl RetryPolicies {
    /// Same policy for every class (auth errors stay fatal).
    #[must_use]
    pub fn uniform(policy: BackoffPolicy) -> Self {
        Self {
            rate_limited: policy.clone(),
            server_error: policy.clone(),
            network_error: policy.clone(),
            unknown: policy,
        }
    }

    /// Policy for `class`, `None` for classes that are never retried.
    #[must_use]
    pub fn for_class(&self, class: ErrorClassification) -> Option<&BackoffPolicy> {
        match class {
            ErrorClassification::RateLimited => Some(&self.rate_limited),
            ErrorClassification::ServerError => Some(&self.server_error),
            ErrorClassification::NetworkError => Some(&self.network_error),
            ErrorClassification::Unknown => Some(&self.unknown),
            ErrorClassification::AuthError => None,
        }
    }
}
