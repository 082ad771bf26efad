//! Per-middleware circuit breaker.
//!
//! An interceptor that keeps failing gets benched: after
//! `failure_threshold` consecutive failures the breaker opens and the chain
//! routes around it. Once the reset window has passed, probe executions are
//! admitted; `success_threshold` clean probes put the interceptor back in
//! rotation, while any probe failure benches it again.
//!
//! State lives behind one mutex as a phase enum with embedded counters, so
//! a strike count can never be observed alongside the wrong phase.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allowing requests.
    Closed,
    /// Blocking requests.
    Open,
    /// Allowing probe requests to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and stats.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Phase of the breaker, with the data that only exists in that phase.
#[derive(Debug, Clone, Copy)]
enum Phase {
    /// In rotation; counts consecutive failures.
    Closed { strikes: u32 },
    /// Benched since the recorded instant.
    Benched { since: Instant },
    /// Probing; counts clean probes so far.
    Probing { clean: u32 },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    trips: u64,
    last_trip: Option<Instant>,
}

/// Observability snapshot, cheap to clone.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// How many times the middleware has been benched.
    pub trips: u64,
    /// Time since the middleware was last benched.
    pub since_last_trip: Option<Duration>,
    /// Time until a probe is admitted (zero unless open).
    pub probe_in: Duration,
    /// Consecutive failures counted so far (closed phase only).
    pub consecutive_failures: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
}

/// Circuit breaker guarding one middleware.
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker named after the middleware it guards.
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_window: config.reset_timeout(),
            inner: Mutex::new(Inner {
                phase: Phase::Closed { strikes: 0 },
                trips: 0,
                last_trip: None,
            }),
        }
    }

    /// Whether the guarded middleware may run.
    ///
    /// While benched, the first call after the reset window moves the
    /// breaker into the probing phase and is admitted as the probe.
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed { .. } | Phase::Probing { .. } => true,
            Phase::Benched { since } => {
                if since.elapsed() < self.reset_window {
                    return false;
                }
                inner.phase = Phase::Probing { clean: 0 };
                debug!(
                    interceptor = %self.name,
                    "Reset window elapsed, admitting probe execution"
                );
                true
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed { strikes } if strikes > 0 => {
                inner.phase = Phase::Closed { strikes: 0 };
            }
            Phase::Probing { clean } => {
                let clean = clean + 1;
                if clean >= self.success_threshold {
                    inner.phase = Phase::Closed { strikes: 0 };
                    info!(
                        interceptor = %self.name,
                        probes = clean,
                        "Middleware recovered, back in rotation"
                    );
                } else {
                    inner.phase = Phase::Probing { clean };
                }
            }
            Phase::Closed { .. } | Phase::Benched { .. } => {}
        }
    }

    /// Record a failed execution.
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed { strikes } => {
                let strikes = strikes + 1;
                if strikes >= self.failure_threshold {
                    self.bench(&mut inner, strikes);
                } else {
                    inner.phase = Phase::Closed { strikes };
                }
            }
            Phase::Probing { .. } => {
                warn!(interceptor = %self.name, "Probe execution failed");
                self.bench(&mut inner, self.failure_threshold);
            }
            Phase::Benched { .. } => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Benched { .. } => CircuitState::Open,
            Phase::Probing { .. } => CircuitState::HalfOpen,
        }
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let (state, probe_in, consecutive_failures) = match inner.phase {
            Phase::Closed { strikes } => (CircuitState::Closed, Duration::ZERO, strikes),
            Phase::Probing { .. } => (CircuitState::HalfOpen, Duration::ZERO, 0),
            Phase::Benched { since } => (
                CircuitState::Open,
                self.reset_window.saturating_sub(since.elapsed()),
                0,
            ),
        };
        CircuitBreakerStats {
            state,
            trips: inner.trips,
            since_last_trip: inner.last_trip.map(|at| at.elapsed()),
            probe_in,
            consecutive_failures,
            failure_threshold: self.failure_threshold,
        }
    }

    /// Bench the middleware: open the circuit and note the trip.
    fn bench(&self, inner: &mut Inner, strikes: u32) {
        let now = Instant::now();
        inner.phase = Phase::Benched { since: now };
        inner.trips += 1;
        inner.last_trip = Some(now);
        warn!(
            interceptor = %self.name,
            strikes,
            trips = inner.trips,
            reset_secs = self.reset_window.as_secs(),
            "Benching failing middleware, chain will route around it"
        );
    }
}
