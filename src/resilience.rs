// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: redelivery backoff and rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff between redeliveries, plus the
//!   delivery cap after which a record is quarantined
//! - [`RateLimiter`]: Token bucket throttling applies to a secondary
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use store_replication::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! let retry = RetryConfig::default();
//! let _delay = retry.delay_for_attempt(3);
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Redelivery behavior for the background consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first redelivery.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Deliveries allowed before quarantine. `None` retries forever.
    pub max_deliveries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_deliveries: Some(10),
        }
    }
}

impl RetryConfig {
    /// Retry forever, never quarantine.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s (cap)
    /// ```
    pub fn unbounded() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            max_deliveries: None,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_deliveries: Some(3),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Has a record used up its deliveries?
    ///
    /// `delivery_count` counts the delivery that just failed.
    pub fn exhausted(&self, delivery_count: u32) -> bool {
        match self.max_deliveries {
            Some(max) => delivery_count >= max,
            None => false,
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each apply consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            max_deliveries: None,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped() {
        let retry = RetryConfig::unbounded();
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(300));
        assert_eq!(retry.delay_for_attempt(usize::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_exhausted() {
        let retry = RetryConfig::testing();
        assert!(!retry.exhausted(1));
        assert!(!retry.exhausted(2));
        assert!(retry.exhausted(3));
        assert!(retry.exhausted(4));
    }

    #[test]
    fn test_unbounded_never_exhausted() {
        let retry = RetryConfig::unbounded();
        assert!(!retry.exhausted(u32::MAX));
    }

    #[tokio::test]
    async fn test_rate_limiter_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 3);
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..10 {
            limiter.acquire().await;
        }
    }

    #[test]
    fn test_rate_limiter_zero_config_clamps() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }
}
