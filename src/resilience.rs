// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: connect backoff and single-flight guards.
//!
//! - [`RetryConfig`]: exponential backoff for the peer connect loop
//! - [`SingleFlight`]: at most one in-flight operation, released on drop
//!
//! # Example
//!
//! ```rust
//! use counter_replication::resilience::SingleFlight;
//!
//! let flight = SingleFlight::new();
//! let guard = flight.try_acquire().expect("idle");
//! assert!(flight.try_acquire().is_none()); // busy
//! drop(guard);
//! assert!(flight.try_acquire().is_some());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` retries until stopped.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (`1.0` = fixed interval, `2.0` = double each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // Cap before converting: a large exponent overflows to infinity
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

// =============================================================================
// Single-flight
// =============================================================================

/// Admits one holder at a time without blocking.
///
/// Used per peer link so that at most one outbound sync is in flight.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

/// Held while the operation runs. Dropping it frees the slot, including on
/// early return or panic.
#[derive(Debug)]
pub struct SingleFlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or `None` if someone else holds it.
    pub fn try_acquire(&self) -> Option<SingleFlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlightGuard { flight: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_bounded() {
        let config = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn test_should_retry_unbounded() {
        let config = RetryConfig {
            max_attempts: usize::MAX,
            ..RetryConfig::default()
        };
        assert!(config.should_retry(1_000_000));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_fixed_interval() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(50), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_huge_attempt_does_not_overflow() {
        let config = RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        };
        assert_eq!(config.delay_for_attempt(100_000), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_single_flight_exclusive() {
        let flight = SingleFlight::new();
        let guard = flight.try_acquire();
        assert!(guard.is_some());
        assert!(flight.is_busy());
        assert!(flight.try_acquire().is_none());

        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_acquire().is_some());
    }

    #[test]
    fn test_single_flight_released_on_panic() {
        let flight = SingleFlight::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = flight.try_acquire().unwrap();
            panic!("sync blew up");
        }));
        assert!(result.is_err());
        assert!(!flight.is_busy());
    }

    #[test]
    fn test_single_flight_threads() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let flight = Arc::new(SingleFlight::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let guard = flight.try_acquire();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if flight.try_acquire().is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 0);
        drop(guard);
    }
}
