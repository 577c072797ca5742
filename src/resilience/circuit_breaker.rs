//! Per-route circuit breaker.
//!
//! ```text
//! Closed → Open:      consecutive failures >= threshold
//! Open → HalfOpen:    after reset timeout, one probe allowed
//! HalfOpen → Closed:  probe succeeds
//! HalfOpen → Open:    probe fails
//! ```

use crate::config::CircuitBreakerConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admits a call, or returns `None` while the circuit is open. In HalfOpen
    /// only one probe is admitted at a time.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    tracing::info!(route = %self.name, "Circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                }
                elapsed
            }
            CircuitState::HalfOpen => !std::mem::replace(&mut inner.probe_in_flight, true),
        };

        drop(inner);

        admitted.then(|| Permit {
            breaker: self,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(route = %self.name, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                route = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn release(&self) {
        self.lock().probe_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An admitted call. Dropping it without a verdict (cancelled, credential
/// failure, caller went away) frees the half-open slot.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Permit<'_> {
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    fn trip(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().fail();
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(2, 60_000);
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = breaker(2, 60_000);
        trip(&breaker);
        breaker.try_acquire().unwrap().succeed();
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let breaker = breaker(1, 0);
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        let probe = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_none());

        probe.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = breaker(1, 0);
        trip(&breaker);
        breaker.try_acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_unsettled_permit_frees_half_open_slot() {
        let breaker = breaker(1, 0);
        trip(&breaker);

        let probe = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());
        drop(probe);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_some());
    }
}
