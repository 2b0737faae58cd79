use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use discogs_config::shared::CircuitBreakerConfig;
use metrics::{counter, gauge};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::metrics::{
    DEPENDENCY_LABEL, DISCOGS_CIRCUIT_BREAKER_STATE, DISCOGS_CIRCUIT_BREAKER_TRIPS_TOTAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through, failures are counted.
    Closed,
    /// Calls are rejected until the recovery window elapses.
    Open,
    /// A single trial call decides between closing and reopening.
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Trips since the breaker last closed, grows the recovery window.
    consecutive_trips: u32,
    total_trips: u64,
    last_failure_at: Option<Instant>,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Point in time view of a breaker, rendered by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_trips: u64,
    /// Milliseconds until a trial call is allowed, while open.
    pub retry_in_ms: Option<u64>,
    pub seconds_since_last_failure: Option<u64>,
}

/// Circuit breaker guarding one dependency.
///
/// Transitions depend only on consecutive failures and elapsed time:
/// `failure_threshold` consecutive failures open the breaker, the first call after the
/// recovery window becomes the half open trial, and the trial outcome closes or reopens it.
/// Each reopen from half open grows the recovery window by `recovery_backoff_multiplier`,
/// capped at `max_recovery_timeout_ms`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        gauge!(DISCOGS_CIRCUIT_BREAKER_STATE, DEPENDENCY_LABEL => name.clone())
            .set(CircuitState::Closed.as_gauge());

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_trips: 0,
                total_trips: 0,
                last_failure_at: None,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks permission for one call.
    ///
    /// Fails with [`ErrorKind::CircuitOpen`] while the breaker is open, or while it is half open
    /// and the trial call is still running.
    pub fn try_acquire(&self) -> EtlResult<CallPermit<'_>> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let open_until = inner.open_until.unwrap_or(now);
                if now < open_until {
                    return Err(etl_error!(
                        ErrorKind::CircuitOpen,
                        "Circuit breaker is open",
                        format!(
                            "{} rejects calls for another {}ms",
                            self.name,
                            (open_until - now).as_millis()
                        )
                    ));
                }

                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(etl_error!(
                ErrorKind::CircuitOpen,
                "Circuit breaker trial call in progress",
                self.name.clone()
            )),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();

        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_trips: inner.total_trips,
            retry_in_ms: match inner.state {
                CircuitState::Open => inner
                    .open_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            seconds_since_last_failure: inner
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_secs()),
        }
    }

    /// Recovery window applied after `consecutive_trips` reopenings, before jitter.
    pub fn base_recovery_window(&self, consecutive_trips: u32) -> Duration {
        let multiplier = self
            .config
            .recovery_backoff_multiplier
            .powi(consecutive_trips.min(32) as i32);
        let window_ms = (self.config.recovery_timeout_ms as f64 * multiplier)
            .min(self.config.max_recovery_timeout_ms as f64);

        Duration::from_millis(window_ms as u64)
    }

    fn recovery_window(&self, consecutive_trips: u32) -> Duration {
        let base = self.base_recovery_window(consecutive_trips);
        let jitter = self.config.recovery_jitter_percent as f64 / 100.0;
        if jitter == 0.0 {
            return base;
        }

        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(factor)
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;

        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_trips = 0;
            inner.open_until = None;
            self.transition(&mut inner, CircuitState::Closed);
            info!(dependency = %self.name, "circuit breaker closed after successful trial call");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);

        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_trips = inner.consecutive_trips.saturating_add(1);
            self.open(&mut inner, now);
            return;
        }

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.open(&mut inner, now);
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        let window = self.recovery_window(inner.consecutive_trips);
        inner.open_until = Some(now + window);
        inner.total_trips += 1;
        self.transition(inner, CircuitState::Open);

        counter!(DISCOGS_CIRCUIT_BREAKER_TRIPS_TOTAL, DEPENDENCY_LABEL => self.name.clone())
            .increment(1);
        warn!(
            dependency = %self.name,
            consecutive_failures = inner.consecutive_failures,
            recovery_window_ms = window.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn transition(&self, inner: &mut BreakerInner, state: CircuitState) {
        inner.state = state;
        gauge!(DISCOGS_CIRCUIT_BREAKER_STATE, DEPENDENCY_LABEL => self.name.clone())
            .set(state.as_gauge());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Permission for a single call. Report the outcome with [`CallPermit::success`] or
/// [`CallPermit::failure`]. Dropping it unreported releases a half open trial slot without
/// counting an outcome.
#[derive(Debug)]
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.on_abandoned(self.trial);
        }
    }
}
