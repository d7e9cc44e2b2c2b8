//! Circuit breaker for outbound calls.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (requests >= minimum_requests and failures/requests >= failure_ratio)
//! OPEN → HALF_OPEN (timeout elapsed)
//! HALF_OPEN → CLOSED (max_requests consecutive successes)
//! HALF_OPEN → OPEN (any failure)
//! ```
//!
//! Counters belong to a *generation*. Every transition, and every interval
//! boundary while closed, starts a new generation. Outcomes reported for an
//! older generation are dropped, so each completed call is counted at most
//! once and only against the epoch it was admitted in.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::infrastructure::clock::SharedClock;
use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls are let through.
    HalfOpen,
}

impl BreakerState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trial calls allowed while half-open.
    pub max_requests: u32,
    /// Counter reset period while closed. Zero disables the reset.
    pub interval: Duration,
    /// Time spent open before probing.
    pub timeout: Duration,
    /// Requests needed before the failure ratio is evaluated.
    pub minimum_requests: u32,
    /// Failure ratio that trips the breaker.
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            minimum_requests: 10,
            failure_ratio: 0.6,
        }
    }
}

impl CircuitBreakerConfig {
    /// Trip predicate evaluated after each call while closed.
    #[must_use]
    pub fn should_trip(&self, counts: &Counts) -> bool {
        if counts.requests == 0 || counts.requests < self.minimum_requests {
            return false;
        }
        let ratio = f64::from(counts.total_failures) / f64::from(counts.requests);
        ratio >= self.failure_ratio
    }
}

/// Counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Completed calls.
    pub requests: u32,
    /// Completed calls that succeeded.
    pub total_successes: u32,
    /// Completed calls that failed.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    const fn on_success(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    const fn on_failure(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Result of a call as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Dependency behaved.
    Success,
    /// Dependency fault.
    Failure,
}

/// Why the breaker refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    /// Breaker is open.
    #[error("circuit breaker is open")]
    Open,
    /// Half-open trial slots are taken.
    #[error("too many requests")]
    TooManyRequests,
}

/// Admission ticket tying an outcome to the generation it was admitted in.
///
/// Consumed by [`Admission::record`]. A ticket dropped without an outcome
/// (cancelled, timed out or unwound by a panic) is released as abandoned,
/// freeing its half-open trial slot.
#[derive(Debug)]
#[must_use = "dropping an admission releases it as abandoned"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    /// Report how the admitted call ended.
    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.settle(self.generation, outcome);
    }

    /// Release the ticket without an outcome.
    pub fn abandon(self) {}
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    half_open_admitted: u32,
}

type Transition = (BreakerState, BreakerState);

/// Circuit breaker guarding one remote dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let expiry = interval_expiry(&config, now);
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                half_open_admitted: 0,
            }),
        }
    }

    /// Dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying time-based transitions.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let transition = self.refresh(&mut inner, now);
        let state = inner.state;
        drop(inner);
        self.report(transition);
        state
    }

    /// Counters of the current generation.
    #[must_use]
    pub fn counts(&self) -> Counts {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let transition = self.refresh(&mut inner, now);
        let counts = inner.counts;
        drop(inner);
        self.report(transition);
        counts
    }

    /// Ask to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] while open and
    /// [`BreakerError::TooManyRequests`] when half-open slots are used up.
    pub fn admit(&self) -> Result<Admission<'_>, BreakerError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let transition = self.refresh(&mut inner, now);

        let result = match inner.state {
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen if inner.half_open_admitted >= self.config.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            BreakerState::HalfOpen => {
                inner.half_open_admitted += 1;
                Ok(self.ticket(inner.generation))
            }
            BreakerState::Closed => Ok(self.ticket(inner.generation)),
        };
        drop(inner);
        self.report(transition);
        result
    }

    /// Report how an admitted call ended.
    pub fn record(&self, admission: Admission<'_>, outcome: Outcome) {
        admission.record(outcome);
    }

    /// Release an admission whose call never produced an outcome.
    pub fn abandon(&self, admission: Admission<'_>) {
        admission.abandon();
    }

    const fn ticket(&self, generation: u64) -> Admission<'_> {
        Admission {
            breaker: self,
            generation,
            settled: false,
        }
    }

    fn settle(&self, generation: u64, outcome: Outcome) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut transition = self.refresh(&mut inner, now);

        if generation == inner.generation {
            match (inner.state, outcome) {
                (BreakerState::Closed, outcome) => {
                    match outcome {
                        Outcome::Success => inner.counts.on_success(),
                        Outcome::Failure => inner.counts.on_failure(),
                    }
                    if self.config.should_trip(&inner.counts) {
                        transition = Some(self.set_state(&mut inner, BreakerState::Open, now));
                    }
                }
                (BreakerState::HalfOpen, Outcome::Success) => {
                    inner.counts.on_success();
                    if inner.counts.consecutive_successes >= self.config.max_requests {
                        transition = Some(self.set_state(&mut inner, BreakerState::Closed, now));
                    }
                }
                (BreakerState::HalfOpen, Outcome::Failure) => {
                    inner.counts.on_failure();
                    transition = Some(self.set_state(&mut inner, BreakerState::Open, now));
                }
                (BreakerState::Open, _) => {}
            }
        }
        drop(inner);
        self.report(transition);
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation == inner.generation && inner.state == BreakerState::HalfOpen {
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }

    /// Apply time-based transitions: interval reset while closed and
    /// open to half-open after the timeout.
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    inner.generation += 1;
                    inner.counts = Counts::default();
                    inner.expiry = interval_expiry(&self.config, now);
                }
                None
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    Some(self.set_state(inner, BreakerState::HalfOpen, now))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => None,
        }
    }

    fn set_state(&self, inner: &mut Inner, to: BreakerState, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.half_open_admitted = 0;
        inner.expiry = match to {
            BreakerState::Closed => interval_expiry(&self.config, now),
            BreakerState::Open => Some(now + self.config.timeout),
            BreakerState::HalfOpen => None,
        };
        (from, to)
    }

    fn report(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        metrics::record_breaker_transition(&self.name, from.as_str(), to.as_str());
        match to {
            BreakerState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker opened"
            ),
            BreakerState::HalfOpen => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker testing"
            ),
            BreakerState::Closed => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker closed"
            ),
        }
    }
}

fn interval_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    (!config.interval.is_zero()).then(|| now + config.interval)
}

// =============================================================================
// Tests
// =============================================================================
