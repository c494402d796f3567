//! Per-service circuit breaker.
//!
//! After `failure_threshold` failures the circuit trips (OPEN) and calls
//! fail fast until `recovery_time` elapses. The OPEN -> HALF_OPEN transition
//! is evaluated lazily on `is_open()` — there is no background timer. In
//! HALF_OPEN one trial call is let through; its outcome either closes the
//! circuit or trips it again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Service label for log messages.
    service: String,
    failure_threshold: u32,
    recovery_time: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: &str, failure_threshold: u32, recovery_time: Duration) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold: failure_threshold.max(1),
            recovery_time,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Whether calls must fail fast right now.
    ///
    /// Querying an OPEN breaker whose recovery window has elapsed moves it
    /// to HALF_OPEN and returns `false`, admitting the probe call. State
    /// transitions happen as a side effect of this query.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(self.recovery_time);
                if elapsed >= self.recovery_time {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(
                        "circuit_breaker[{}]: OPEN -> HALF_OPEN (recovery window elapsed)",
                        self.service
                    );
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a successful call. A HALF_OPEN probe success resets the
    /// failure count and closes the circuit; a no-op while CLOSED.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.failure_count = 0;
            inner.last_failure_time = None;
            inner.state = BreakerState::Closed;
            tracing::info!(
                "circuit_breaker[{}]: HALF_OPEN -> CLOSED (probe succeeded)",
                self.service
            );
        }
    }

    /// Record a failed call. Trips the circuit when the threshold is reached
    /// while CLOSED, and re-trips immediately on a failed HALF_OPEN probe.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            BreakerState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    "circuit_breaker[{}]: TRIPPED after {} consecutive failures — \
                     failing fast for {}s",
                    self.service,
                    inner.failure_count,
                    self.recovery_time.as_secs()
                );
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    "circuit_breaker[{}]: HALF_OPEN -> OPEN (probe failed)",
                    self.service
                );
            }
            _ => {}
        }
    }

    /// Seconds until the next half-open probe would be allowed, for the
    /// fail-fast error message. Zero when not OPEN.
    pub fn retry_in_secs(&self) -> u64 {
        let inner = self.lock();
        if inner.state != BreakerState::Open {
            return 0;
        }
        inner
            .last_failure_time
            .map(|t| {
                self.recovery_time
                    .saturating_sub(t.elapsed())
                    .as_secs()
            })
            .unwrap_or(0)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
