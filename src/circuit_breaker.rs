// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for secondary store writes.
//!
//! Stops a consumer (or the mirror engine) from hammering a secondary that is
//! down. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, writes pass through
//! - **Open**: Secondary unhealthy, writes fail fast without attempting
//! - **HalfOpen**: Testing if the secondary recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use store_replication::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = CircuitBreaker::new("secondary", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* applied */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, back off */ }
//!     Err(CircuitError::Inner(e)) => { /* store error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    recovery_timeout: Duration,
    failure_threshold: u32,

    /// When the circuit last tripped or rejected a call, cleared by the next success.
    opened_at: Mutex<Option<Instant>>,
    /// Failures since the last success or trip.
    consecutive_failures: AtomicU32,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // Trips once the closed ring buffer is entirely failures.
        let recloser = Recloser::custom()
            .error_rate(0.99)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            recovery_timeout: config.recovery_timeout,
            failure_threshold: config.failure_threshold.max(1),
            opened_at: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.set_opened_at(None);
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.name, "success");
                crate::metrics::set_circuit_state(&self.name, "closed");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.set_opened_at(Some(Instant::now()));
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                crate::metrics::set_circuit_state(&self.name, "open");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");

                // The recloser trips once its closed window is all failures.
                let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= self.failure_threshold {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.set_opened_at(Some(Instant::now()));
                    warn!(circuit = %self.name, failures = streak, "Circuit breaker tripped");
                    crate::metrics::set_circuit_state(&self.name, "open");
                }
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn set_opened_at(&self, value: Option<Instant>) {
        if let Ok(mut guard) = self.opened_at.lock() {
            *guard = value;
        }
    }

    /// Observed state.
    ///
    /// Open from the failure that trips the circuit until the recovery
    /// timeout passes, half-open after that until a call succeeds.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let last = self.opened_at.lock().ok().and_then(|guard| *guard);
        match last {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.recovery_timeout => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// Is the circuit currently rejecting calls?
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Get total number of calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::testing());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::testing());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..5 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }

        assert!(cb.rejections() >= 1);
        assert!(cb.is_open());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_open_as_soon_as_threshold_reached() {
        let config = CircuitConfig {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        assert!(!cb.is_open());

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        assert_eq!(cb.rejections(), 0);
        assert!(cb.is_open());

        // The recloser agrees: the very next call never runs
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;

        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new("test", CircuitConfig::testing());

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        assert!(cb.is_open());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let config = CircuitConfig {
            failure_threshold: 100,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("y") }).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
        assert_eq!(cb.calls_total(), 4);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert!(rejected.is_rejected());
        assert!(rejected.inner().is_none());

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(!inner.is_rejected());
        assert_eq!(inner.inner(), Some(&"boom"));
    }
}
