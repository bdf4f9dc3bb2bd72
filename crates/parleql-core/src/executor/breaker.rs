//! Per-backend circuit breaker.
//!
//! Closed until `threshold` consecutive failures, then open for the
//! cool-off period. The first caller after cool-off gets the half-open
//! probe slot; its outcome closes or re-opens the breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{ParleQLError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cool_off: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, threshold: u32, cool_off: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cool_off,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate a call.
    ///
    /// # Errors
    ///
    /// [`ParleQLError::BreakerOpen`] while the breaker is open and the
    /// cool-off has not elapsed. After cool-off, exactly one caller gets
    /// through as the half-open probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::HalfOpen => Err(ParleQLError::BreakerOpen {
                backend: self.name.clone(),
            }),
            State::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= self.cool_off {
                    info!(breaker = %self.name, "cool-off elapsed; half-open probe");
                    inner.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(ParleQLError::BreakerOpen {
                        backend: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != State::Closed {
            info!(breaker = %self.name, "probe succeeded; closing");
        }
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                warn!(breaker = %self.name, "probe failed; re-opening");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
            }
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "threshold reached; opening"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }

    /// Whether calls are currently rejected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == State::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("oracle", 3, Duration::from_secs(30));
        for _ in 0..2 {
            breaker.record_failure();
        }
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.try_acquire(),
            Err(ParleQLError::BreakerOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("postgres", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn half_open_allows_one_probe() {
        let breaker = CircuitBreaker::new("doris", 1, Duration::ZERO);
        breaker.record_failure();
        // Cool-off of zero: next acquire is the probe.
        assert!(breaker.try_acquire().is_ok());
        // Second concurrent caller is rejected while the probe is out.
        assert!(breaker.try_acquire().is_err());
        breaker.record_success();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new("doris", 1, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}
