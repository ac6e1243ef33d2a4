//! Circuit breaker guarding cache store calls

use crate::cache::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Copy of the breaker state for metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub times_opened: u64,
}

struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

/// Closed -> Open after `failure_threshold` consecutive failures; Open fails
/// fast until `recovery_timeout` has passed, then admits exactly one trial
/// call in HalfOpen. Only the trial's outcome leaves HalfOpen; calls admitted
/// before the circuit opened only update counters. The lock is never held
/// across an await.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

/// Admission to one protected call. Dropping a trial permit without
/// reporting an outcome frees the trial slot again.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report success; returns true when this closed the circuit
    pub fn succeed(mut self) -> bool {
        self.settled = true;
        self.breaker.on_success(self.trial)
    }

    /// Report failure; returns true when this opened the circuit
    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                times_opened: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call; fails fast with `CircuitOpen`
    pub fn acquire(&self) -> Result<Permit<'_>, CacheError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.recovery_timeout {
                    return Err(CacheError::CircuitOpen);
                }
                tracing::info!("Cache circuit breaker half-open, admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CacheError::CircuitOpen);
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                false
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!("Cache circuit breaker closed after successful trial");
                true
            }
            // Admitted before the circuit opened
            CircuitState::HalfOpen | CircuitState::Open => false,
        }
    }

    fn on_failure(&self, trial: bool) -> bool {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        let open = match inner.state {
            CircuitState::HalfOpen => trial,
            CircuitState::Closed => inner.failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            inner.times_opened += 1;
            tracing::warn!(
                "Cache circuit breaker opened after {} consecutive failures",
                inner.failures
            );
        }
        open
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failures,
            last_failure: inner.last_failure,
            failure_threshold: self.failure_threshold,
            recovery_timeout_ms: self.recovery_timeout.as_millis() as u64,
            times_opened: inner.times_opened,
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        tracing::info!("Cache circuit breaker reset");
    }
}
