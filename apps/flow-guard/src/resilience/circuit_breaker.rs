//! Circuit breaker for external dependency calls.
//!
//! Stops calling a dependency (broker API, pub/sub transport) while it is
//! failing and periodically probes it for recovery.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN    (recovery_timeout elapsed since last failure; first probe)
//! HALF_OPEN → CLOSED  (a probe succeeds)
//! HALF_OPEN → OPEN    (a probe fails)
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: Failures that open the circuit (default: 5)
//! - `recovery_timeout`: Time to stay open before probing (default: 60s)
//! - `half_open_max_attempts`: Probe calls allowed in `HALF_OPEN` (default: 3)
//!
//! # Example
//!
//! ```rust
//! use flow_guard::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("broker", CircuitBreakerConfig::default());
//!
//! if breaker.can_execute() {
//!     // call the dependency, then:
//!     breaker.record_success();
//! } else {
//!     // fail fast
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is testing with limited calls.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Numeric encoding for gauges (0 = closed, 1 = open, 2 = half-open).
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures that move `CLOSED` to `OPEN`.
    pub failure_threshold: u32,
    /// Time since the last failure before `OPEN` admits a probe.
    pub recovery_timeout: Duration,
    /// Probe calls permitted in `HALF_OPEN`.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for the broker order API.
    #[must_use]
    pub fn broker() -> Self {
        Self::default()
    }

    /// Configuration for the pub/sub publisher.
    ///
    /// More sensitive, recovers sooner: a stalled publisher should be
    /// probed again quickly since market data goes stale fast.
    #[must_use]
    pub const fn publisher() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
    last_error: Option<String>,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    state_transitions: u64,
}

impl BreakerInner {
    const fn new() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_attempts: 0,
            last_error: None,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            state_transitions: 0,
        }
    }
}

/// Circuit breaker for external dependency calls.
///
/// Every read and mutation goes through one lock, so concurrent call sites
/// observe a single serialized sequence of transitions.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Dependency name for logging.
    name: String,
    /// Configuration.
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        };
        metrics::set_circuit_state(&breaker.name, CircuitBreakerState::Closed);
        breaker
    }

    /// Get the dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state.
    ///
    /// Pure read: an `OPEN` breaker whose recovery timeout has elapsed still
    /// reports `OPEN` until a caller asks [`Self::can_execute`].
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Get the current failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Check whether a call may proceed.
    ///
    /// In `OPEN`, the first call after the recovery timeout moves the breaker
    /// to `HALF_OPEN` and counts as probe #1.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();

        let permitted = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let recovered = inner
                    .last_failure_time
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    inner.half_open_attempts = 1;
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_attempts {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !permitted {
            inner.rejected_calls += 1;
            drop(inner);
            metrics::record_circuit_rejection(&self.name);
        }

        permitted
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitBreakerState::HalfOpen => {
                self.transition(&mut inner, CircuitBreakerState::Closed);
                inner.failure_count = 0;
                inner.half_open_attempts = 0;
            }
            CircuitBreakerState::Closed => {
                if inner.failure_count != 0 {
                    inner.failure_count = 0;
                }
            }
            CircuitBreakerState::Open => {
                // A call admitted before the breaker opened finished late.
                tracing::debug!(
                    name = %self.name,
                    "Success recorded while circuit is OPEN"
                );
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, error: &dyn Display) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        error = %error,
                        "Failure threshold reached"
                    );
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                tracing::warn!(
                    name = %self.name,
                    error = %error,
                    "Probe call failed"
                );
                self.transition(&mut inner, CircuitBreakerState::Open);
                inner.half_open_attempts = 0;
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Force the circuit closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
        inner.last_failure_time = None;
        drop(inner);
        tracing::info!(name = %self.name, "Circuit breaker reset");
    }

    /// Force the circuit open (operator kill switch).
    ///
    /// The recovery timeout starts now.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());
        inner.half_open_attempts = 0;
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Get metrics for this circuit breaker.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_attempts: inner.half_open_attempts,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            state_transitions: inner.state_transitions,
            last_error: inner.last_error.clone(),
        }
    }

    /// Move to `to`, logging and counting the transition. Caller holds the lock.
    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.state_transitions += 1;
        metrics::set_circuit_state(&self.name, to);

        match to {
            CircuitBreakerState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker opened"
            ),
            CircuitBreakerState::HalfOpen => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker testing"
            ),
            CircuitBreakerState::Closed => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker closed"
            ),
        }
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Dependency name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Failures since the circuit last closed.
    pub failure_count: u32,
    /// Probes admitted in the current `HALF_OPEN` period.
    pub half_open_attempts: u32,
    /// Lifetime successes.
    pub total_successes: u64,
    /// Lifetime failures.
    pub total_failures: u64,
    /// Calls refused by the breaker.
    pub rejected_calls: u64,
    /// Number of state transitions.
    pub state_transitions: u64,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

/// Named collection of circuit breakers, one per protected dependency.
///
/// Created once at startup and shared by reference.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `default_config`.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a breaker with its own configuration.
    ///
    /// Replaces any breaker already registered under the same name.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config));
        self.breakers.write().insert(name, Arc::clone(&breaker));
        breaker
    }

    /// Get the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
        }))
    }

    /// Get the breaker for `name`, if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Get metrics for every breaker, sorted by name.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.metrics())
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Reset every breaker to `CLOSED`.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
