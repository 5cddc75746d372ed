//! Per-service circuit breaker registry
//!
//! The registry owns one state machine per service key:
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                               │  cooldown elapsed,
//!     │ trial succeeds                │  next call becomes the trial
//!     │                               ▼
//!     └─────────────────────────── HalfOpen
//!                trial fails: back to Open, cooldown restarts
//! ```
//!
//! Records live in a sharded [`DashMap`], each behind its own mutex, so
//! callers targeting different services never contend on one lock. Every
//! transition happens while holding the record's mutex, which makes the
//! Open→HalfOpen step and the claim of the trial slot a single atomic action.
//!
//! [`guard`](CircuitBreakerRegistry::guard) hands out an owned [`Permit`];
//! [`record_outcome`](CircuitBreakerRegistry::record_outcome) consumes it. A
//! permit dropped without an outcome gives its half-open slot back, and a
//! permit issued before a transition cannot drive transitions after it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult};
use super::events::{EventListener, ResilienceEvent, TracingListener};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for one service's breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls that open the circuit
    pub failure_threshold: u32,
    /// Time to stay open before admitting a trial call
    pub cooldown: Duration,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30), half_open_max_trials: 1 }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }

        if self.half_open_max_trials == 0 {
            return Err(ConfigError::invalid("half_open_max_trials", "must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for circuit breaker configuration
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn half_open_max_trials(mut self, trials: u32) -> Self {
        self.config.half_open_max_trials = trials;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Mutable breaker state for one service key
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    last_state_change: Instant,
    half_open_in_flight: u32,
    generation: u64,
    config: CircuitBreakerConfig,
}

/// A state change to report once the record lock is released
type Transition = (CircuitState, CircuitState, u32);

impl CircuitRecord {
    fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_state_change: now,
            half_open_in_flight: 0,
            generation: 0,
            config,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.half_open_in_flight = 0;
        self.generation += 1;
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
        (from, to, self.consecutive_failures)
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.config.cooldown.saturating_sub(now.saturating_duration_since(self.last_state_change))
    }
}

/// Read-only snapshot of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStatus {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// `None` for a service key the registry has never seen
    pub last_state_change: Option<Instant>,
    pub half_open_in_flight: u32,
}

impl CircuitStatus {
    fn pristine(service: &str) -> Self {
        Self {
            service: service.to_owned(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_state_change: None,
            half_open_in_flight: 0,
        }
    }

    fn of(service: &str, record: &CircuitRecord) -> Self {
        Self {
            service: service.to_owned(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            last_state_change: Some(record.last_state_change),
            half_open_in_flight: record.half_open_in_flight,
        }
    }
}

/// Final outcome of a guarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        }
    }
}

/// The breaker refused a call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{service}' is {state}")]
pub struct Rejection {
    pub service: String,
    pub state: CircuitState,
    /// Remaining cooldown when the circuit is open
    pub retry_after: Option<Duration>,
}

/// Admission ticket for one call
///
/// Hand it back through [`CircuitBreakerRegistry::record_outcome`] once the
/// call has a final outcome.
#[must_use = "a permit must be passed to record_outcome once the call finishes"]
pub struct Permit {
    service: Arc<str>,
    record: Arc<Mutex<CircuitRecord>>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether this permit holds a half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("service", &self.service)
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }

        let mut record = self.record.lock();
        if record.generation == self.generation && record.state == CircuitState::HalfOpen {
            record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
            debug!(service = %self.service, "Released unused half-open trial slot");
        }
    }
}

/// Process-wide map of service key to breaker
pub struct CircuitBreakerRegistry<C: Clock = SystemClock> {
    records: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    default_config: CircuitBreakerConfig,
    clock: C,
    listener: Arc<dyn EventListener>,
}

impl<C: Clock> fmt::Debug for CircuitBreakerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("services", &self.records.len())
            .field("default_config", &self.default_config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry<SystemClock> {
    /// Create a registry on the system clock
    pub fn new(default_config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(default_config, SystemClock)
    }
}

impl Default for CircuitBreakerRegistry<SystemClock> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            default_config: CircuitBreakerConfig::default(),
            clock: SystemClock,
            listener: Arc::new(TracingListener),
        }
    }
}

impl<C: Clock> CircuitBreakerRegistry<C> {
    /// Create a registry with a custom clock (for testing)
    pub fn with_clock(default_config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self {
            records: DashMap::new(),
            default_config,
            clock,
            listener: Arc::new(TracingListener),
        })
    }

    /// Replace the event listener
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Ask for admission under the registry's default configuration
    pub fn guard(&self, service: &str) -> Result<Permit, Rejection> {
        self.guard_with(service, &self.default_config)
    }

    /// Ask for admission under a service-specific configuration
    ///
    /// The configuration is attached to the record on first reference and
    /// refreshed on later calls.
    #[instrument(level = "trace", skip(self, config))]
    pub fn guard_with(
        &self,
        service: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<Permit, Rejection> {
        let record = self.record(service, config);
        let now = self.clock.now();

        let (decision, transition) = {
            let mut state = record.lock();
            if state.config != *config {
                state.config = config.clone();
            }

            match state.state {
                CircuitState::Closed => (Ok((state.generation, false)), None),
                CircuitState::Open => {
                    let remaining = state.remaining_cooldown(now);
                    if remaining.is_zero() {
                        let transition = state.transition(CircuitState::HalfOpen, now);
                        state.half_open_in_flight = 1;
                        (Ok((state.generation, true)), Some(transition))
                    } else {
                        (Err((CircuitState::Open, Some(remaining))), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < state.config.half_open_max_trials {
                        state.half_open_in_flight += 1;
                        (Ok((state.generation, true)), None)
                    } else {
                        (Err((CircuitState::HalfOpen, None)), None)
                    }
                }
            }
        };

        let service_key: Arc<str> = Arc::from(service);
        if let Some(transition) = transition {
            self.emit_transition(&service_key, transition);
        }

        match decision {
            Ok((generation, trial)) => {
                trace!(service, trial, "Circuit breaker admitted call");
                Ok(Permit { service: service_key, record, generation, trial, settled: false })
            }
            Err((state, retry_after)) => {
                self.listener.on_event(&ResilienceEvent::CallRejected {
                    service: service_key,
                    state,
                    retry_after,
                });
                Err(Rejection { service: service.to_owned(), state, retry_after })
            }
        }
    }

    /// Report the final outcome of a permitted call
    pub fn record_outcome(&self, mut permit: Permit, outcome: CallOutcome) {
        permit.settled = true;
        let now = self.clock.now();

        let transition = {
            let mut state = permit.record.lock();
            if state.generation != permit.generation {
                debug!(
                    service = %permit.service,
                    ?outcome,
                    "Ignoring outcome from before the last state change"
                );
                return;
            }

            match (state.state, outcome) {
                (CircuitState::Closed, CallOutcome::Success) => {
                    state.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, CallOutcome::Failure) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if state.consecutive_failures >= state.config.failure_threshold {
                        Some(state.transition(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, CallOutcome::Success) => {
                    Some(state.transition(CircuitState::Closed, now))
                }
                (CircuitState::HalfOpen, CallOutcome::Failure) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    Some(state.transition(CircuitState::Open, now))
                }
                // Open never issues permits of its own generation
                (CircuitState::Open, _) => None,
            }
        };

        if let Some(transition) = transition {
            self.emit_transition(&permit.service, transition);
        }
    }

    /// Read-only snapshot of one breaker
    ///
    /// Never creates a record; an unknown key reports a pristine closed
    /// breaker.
    pub fn get_status(&self, service: &str) -> CircuitStatus {
        match self.records.get(service) {
            Some(entry) => CircuitStatus::of(service, &entry.value().lock()),
            None => CircuitStatus::pristine(service),
        }
    }

    /// Snapshots of every known breaker, sorted by service key
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let mut statuses: Vec<CircuitStatus> = self
            .records
            .iter()
            .map(|entry| CircuitStatus::of(entry.key(), &entry.value().lock()))
            .collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Force a breaker closed
    ///
    /// Returns `false` when the key has never been referenced.
    pub fn reset(&self, service: &str) -> bool {
        let Some(record) = self.records.get(service).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };

        let now = self.clock.now();
        let transition = {
            let mut state = record.lock();
            if state.state == CircuitState::Closed {
                state.consecutive_failures = 0;
                None
            } else {
                Some(state.transition(CircuitState::Closed, now))
            }
        };

        if let Some(transition) = transition {
            self.emit_transition(&Arc::from(service), transition);
        }
        true
    }

    /// Number of service keys seen so far
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record(&self, service: &str, config: &CircuitBreakerConfig) -> Arc<Mutex<CircuitRecord>> {
        if let Some(entry) = self.records.get(service) {
            return Arc::clone(entry.value());
        }

        let record = self.records.entry(service.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitRecord::new(config.clone(), self.clock.now())))
        });
        Arc::clone(record.value())
    }

    fn emit_transition(&self, service: &Arc<str>, (from, to, failures): Transition) {
        self.listener.on_event(&ResilienceEvent::StateTransition {
            service: Arc::clone(service),
            from,
            to,
            consecutive_failures: failures,
        });
    }
}
