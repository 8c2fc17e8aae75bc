//! Circuit breaker guarding calls to a single named dependency.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ------------------------> OPEN
//!     ^                              |  ^
//!     | successes >= threshold       |  | any failure
//!     |                 reset timeout|  |
//!     +------------- HALF_OPEN <-----+--+
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::Classify;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// Probe calls are let through to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    /// Time since the last failure after which an open circuit lets a probe
    /// through.
    pub reset_timeout: Duration,
    /// Consecutive probe successes that close a half-open circuit.
    pub success_threshold: u32,
    /// Probes allowed in flight at once while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_probes: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker `{name}` is open")]
    Open { name: String },
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The dependency's own error, if the call reached it.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

impl<E: Classify> Classify for CircuitBreakerError<E> {
    fn is_transient(&self) -> bool {
        match self {
            Self::Open { .. } => false,
            Self::Operation(e) => e.is_transient(),
        }
    }

    fn is_circuit_open(&self) -> bool {
        match self {
            Self::Open { .. } => true,
            Self::Operation(e) => e.is_circuit_open(),
        }
    }

    fn code(&self) -> Cow<'_, str> {
        match self {
            Self::Open { .. } => Cow::Borrowed("CIRCUIT_OPEN"),
            Self::Operation(e) => e.code(),
        }
    }
}

enum State {
    Closed { failures: u32 },
    Open,
    HalfOpen { successes: u32, in_flight: u32 },
}

struct SharedState {
    state: State,
    last_failure: Option<Instant>,
}

#[derive(Clone, Copy)]
enum Admission {
    Normal,
    Probe,
}

/// Three-state circuit breaker.
///
/// Use one instance per dependency, usually obtained from a
/// [`CircuitBreakerRegistry`] so that every call site talking to the same
/// dependency shares failure state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<SharedState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(SharedState {
                state: State::Closed { failures: 0 },
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose reset timeout has elapsed still
    /// reports `Open` until the next call probes it.
    pub fn state(&self) -> CircuitState {
        match lock(&self.state).state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        match lock(&self.state).state {
            State::Closed { failures } => failures,
            _ => 0,
        }
    }

    /// Consecutive probe successes counted while half-open.
    pub fn success_count(&self) -> u32 {
        match lock(&self.state).state {
            State::HalfOpen { successes, .. } => successes,
            _ => 0,
        }
    }

    pub fn last_failure(&self) -> Option<Instant> {
        lock(&self.state).last_failure
    }

    /// Force the circuit closed and forget all counters.
    pub fn reset(&self) {
        let mut shared = lock(&self.state);
        shared.state = State::Closed { failures: 0 };
        shared.last_failure = None;
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`CircuitBreakerError::Open`] without calling `operation` when
    /// the circuit is open. Any `Err` from the operation counts as a failure
    /// and is returned unchanged inside [`CircuitBreakerError::Operation`].
    /// If the returned future is dropped before the operation finishes, the
    /// call is not recorded at all.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit(Instant::now()).ok_or_else(|| {
            tracing::debug!(breaker = %self.name, "circuit open, rejecting call");
            CircuitBreakerError::Open {
                name: self.name.clone(),
            }
        })?;

        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let result = operation().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(admission, Instant::now());
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    fn admit(&self, now: Instant) -> Option<Admission> {
        let mut shared = lock(&self.state);
        let cooled_down = shared
            .last_failure
            .is_none_or(|at| now.saturating_duration_since(at) > self.config.reset_timeout);

        match &mut shared.state {
            State::Closed { .. } => Some(Admission::Normal),
            State::Open if cooled_down => {
                shared.state = State::HalfOpen {
                    successes: 0,
                    in_flight: 1,
                };
                tracing::debug!(breaker = %self.name, "circuit half-open, probing");
                Some(Admission::Probe)
            }
            State::Open => None,
            State::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.half_open_probes {
                    *in_flight += 1;
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut shared = lock(&self.state);
        match &mut shared.state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen {
                successes,
                in_flight,
            } => {
                // Calls admitted before the circuit opened do not vouch for
                // the dependency.
                if !matches!(admission, Admission::Probe) {
                    return;
                }
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    shared.state = State::Closed { failures: 0 };
                    tracing::info!(breaker = %self.name, "circuit closed, dependency recovered");
                }
            }
            State::Open => {}
        }
    }

    fn on_failure(&self, admission: Admission, now: Instant) {
        let mut shared = lock(&self.state);
        shared.last_failure = Some(now);
        match &mut shared.state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    let failures = *failures;
                    shared.state = State::Open;
                    tracing::warn!(breaker = %self.name, failures, "circuit opened");
                }
            }
            State::HalfOpen { .. } => {
                shared.state = State::Open;
                tracing::warn!(
                    breaker = %self.name,
                    probe = matches!(admission, Admission::Probe),
                    "circuit reopened after failed probe"
                );
            }
            State::Open => {}
        }
    }

    fn release_probe(&self) {
        if let State::HalfOpen { in_flight, .. } = &mut lock(&self.state).state {
            *in_flight = in_flight.saturating_sub(1);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Frees a half-open probe slot when an in-flight call is cancelled.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && matches!(self.admission, Admission::Probe) {
            self.breaker.release_probe();
        }
    }
}

/// Process-wide set of breakers keyed by dependency name.
///
/// Cloning is cheap and clones share the same breakers.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker named `name`, created with `config` if it does not exist
    /// yet. `config` is ignored for existing breakers.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        lock(&self.breakers)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        lock(&self.breakers).get(name).cloned()
    }

    /// State of every registered breaker.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitState> {
        lock(&self.breakers)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in lock(&self.breakers).values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.breakers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
