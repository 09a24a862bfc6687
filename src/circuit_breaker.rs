//! Three-state circuit breaker guarding calls to one remote endpoint.
//!
//! # State Machine
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──> Open
//!   Open ──(recovery_timeout elapsed)──> HalfOpen
//!   HalfOpen ──(trial succeeds)──> Closed
//!   HalfOpen ──(trial fails)──> Open   (timeout restarts)
//! ```
//!
//! While `HalfOpen`, exactly one trial call is admitted; concurrent callers
//! are rejected as if the breaker were `Open`. A trial that is dropped before
//! completing (for example, a cancelled task) counts as a failure so the slot
//! is never leaked.
//!
//! State lives behind a `std::sync::Mutex` that is only held for the
//! transition itself, never across the wrapped call's `.await`.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit open")]
    Open,
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BreakerMetrics {
    pub trips: u64,
    pub rejected: u64,
    pub trials: u64,
    pub recoveries: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    metrics: BreakerMetrics,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                metrics: BreakerMetrics::default(),
            }),
        }
    }

    /// Current state, applying the `Open -> HalfOpen` timeout transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        self.lock().metrics
    }

    /// Run `op` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = match self.admit() {
            Some(permit) => permit,
            None => return Err(BreakerError::Open),
        };

        match op().await {
            Ok(value) => {
                permit.finish(true);
                Ok(value)
            }
            Err(e) => {
                permit.finish(false);
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another caller panicked mid-transition;
        // the counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true);
        if elapsed {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!(breaker = %self.name, state = %BreakerState::HalfOpen, "circuit breaker probing");
        }
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            BreakerState::Closed => Some(Permit {
                breaker: self,
                trial: false,
                done: false,
            }),
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                inner.metrics.trials += 1;
                Some(Permit {
                    breaker: self,
                    trial: true,
                    done: false,
                })
            }
            _ => {
                inner.metrics.rejected += 1;
                None
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if trial {
            inner.trial_in_flight = false;
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.metrics.recoveries += 1;
            tracing::info!(breaker = %self.name, state = %BreakerState::Closed, "circuit breaker closed");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            self.trip(&mut inner);
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.state == BreakerState::Closed && inner.consecutive_failures >= self.failure_threshold {
            self.trip(&mut inner);
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.metrics.trips += 1;
        tracing::warn!(
            breaker = %self.name,
            state = %BreakerState::Open,
            failures = inner.consecutive_failures,
            recovery_secs = self.recovery_timeout.as_secs(),
            "circuit breaker opened"
        );
    }
}

/// Admission ticket for one call. Dropping an unfinished trial counts as failure.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    done: bool,
}

impl Permit<'_> {
    fn finish(&mut self, success: bool) {
        self.done = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done && self.trial {
            self.breaker.on_failure(true);
        }
    }
}
