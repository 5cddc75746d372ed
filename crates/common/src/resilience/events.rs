//! Observable resilience events
//!
//! Every component reports what it does (a retry scheduled, a breaker
//! transition, a near-timeout) as a [`ResilienceEvent`] delivered to an
//! [`EventListener`]. The default [`TracingListener`] renders events as
//! structured `tracing` records; [`MetricsRecorder`] keeps lock-free counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitState;
use crate::error::ErrorKind;

/// Something worth observing happened inside the resilience layer
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// An attempt failed and another one is scheduled after `delay`
    RetryScheduled { service: Arc<str>, attempt: u32, delay: Duration, kind: ErrorKind },
    /// The final permitted attempt failed
    RetriesExhausted { service: Arc<str>, attempts: u32, kind: ErrorKind },
    /// The overall deadline stopped the retry sequence
    DeadlineExceeded { service: Arc<str>, attempts: u32, elapsed: Duration },
    /// An attempt finished within its limit but past the warning threshold
    NearTimeout { service: Arc<str>, attempt: u32, elapsed: Duration, limit: Duration },
    /// An attempt ran past its limit
    AttemptTimedOut { service: Arc<str>, attempt: u32, elapsed: Duration, limit: Duration },
    /// A breaker changed state
    StateTransition {
        service: Arc<str>,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
    },
    /// A breaker rejected a call
    CallRejected { service: Arc<str>, state: CircuitState, retry_after: Option<Duration> },
    /// A fallback produced the call's result
    FallbackInvoked { service: Arc<str>, reason: &'static str },
}

impl ResilienceEvent {
    /// Service key the event belongs to
    pub fn service(&self) -> &str {
        match self {
            Self::RetryScheduled { service, .. }
            | Self::RetriesExhausted { service, .. }
            | Self::DeadlineExceeded { service, .. }
            | Self::NearTimeout { service, .. }
            | Self::AttemptTimedOut { service, .. }
            | Self::StateTransition { service, .. }
            | Self::CallRejected { service, .. }
            | Self::FallbackInvoked { service, .. } => service,
        }
    }

    /// Stable snake_case name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::NearTimeout { .. } => "near_timeout",
            Self::AttemptTimedOut { .. } => "attempt_timed_out",
            Self::StateTransition { .. } => "state_transition",
            Self::CallRejected { .. } => "call_rejected",
            Self::FallbackInvoked { .. } => "fallback_invoked",
        }
    }
}

/// Consumer of resilience events
///
/// Called synchronously on the caller's task; implementations must be cheap
/// and must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ResilienceEvent);
}

impl<T: EventListener + ?Sized> EventListener for Arc<T> {
    fn on_event(&self, event: &ResilienceEvent) {
        (**self).on_event(event);
    }
}

/// Renders events as `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::RetryScheduled { service, attempt, delay, kind } => {
                debug!(
                    service = %service,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = %kind,
                    "Retrying after failure"
                );
            }
            ResilienceEvent::RetriesExhausted { service, attempts, kind } => {
                warn!(service = %service, attempts, kind = %kind, "All retry attempts failed");
            }
            ResilienceEvent::DeadlineExceeded { service, attempts, elapsed } => {
                warn!(
                    service = %service,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Overall deadline exceeded"
                );
            }
            ResilienceEvent::NearTimeout { service, attempt, elapsed, limit } => {
                warn!(
                    service = %service,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = limit.as_millis() as u64,
                    "Attempt close to timeout"
                );
            }
            ResilienceEvent::AttemptTimedOut { service, attempt, elapsed, limit } => {
                warn!(
                    service = %service,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = limit.as_millis() as u64,
                    "Attempt timed out"
                );
            }
            ResilienceEvent::StateTransition { service, from, to, consecutive_failures } => {
                if *to == CircuitState::Open {
                    warn!(
                        service = %service,
                        from = %from,
                        state = %to,
                        consecutive_failures,
                        "Circuit breaker opened"
                    );
                } else {
                    info!(service = %service, from = %from, state = %to, "Circuit breaker state changed");
                }
            }
            ResilienceEvent::CallRejected { service, state, retry_after } => {
                debug!(
                    service = %service,
                    state = %state,
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "Circuit breaker rejected call"
                );
            }
            ResilienceEvent::FallbackInvoked { service, reason } => {
                info!(service = %service, reason, "Using fallback result");
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _event: &ResilienceEvent) {}
}

/// Fan-out to several listeners in order
#[derive(Default, Clone)]
pub struct Listeners {
    inner: Vec<Arc<dyn EventListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn with(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.inner.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.inner.len()).finish()
    }
}

impl EventListener for Listeners {
    fn on_event(&self, event: &ResilienceEvent) {
        for listener in &self.inner {
            listener.on_event(event);
        }
    }
}

/// Lock-free event counters
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    retries_scheduled: AtomicU64,
    retries_exhausted: AtomicU64,
    deadlines_exceeded: AtomicU64,
    near_timeouts: AtomicU64,
    attempts_timed_out: AtomicU64,
    circuits_opened: AtomicU64,
    circuits_closed: AtomicU64,
    calls_rejected: AtomicU64,
    fallbacks_invoked: AtomicU64,
}

/// Point-in-time copy of [`MetricsRecorder`] counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub retries_scheduled: u64,
    pub retries_exhausted: u64,
    pub deadlines_exceeded: u64,
    pub near_timeouts: u64,
    pub attempts_timed_out: u64,
    pub circuits_opened: u64,
    pub circuits_closed: u64,
    pub calls_rejected: u64,
    pub fallbacks_invoked: u64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            deadlines_exceeded: self.deadlines_exceeded.load(Ordering::Relaxed),
            near_timeouts: self.near_timeouts.load(Ordering::Relaxed),
            attempts_timed_out: self.attempts_timed_out.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            circuits_closed: self.circuits_closed.load(Ordering::Relaxed),
            calls_rejected: self.calls_rejected.load(Ordering::Relaxed),
            fallbacks_invoked: self.fallbacks_invoked.load(Ordering::Relaxed),
        }
    }
}

impl EventListener for MetricsRecorder {
    fn on_event(&self, event: &ResilienceEvent) {
        let counter = match event {
            ResilienceEvent::RetryScheduled { .. } => &self.retries_scheduled,
            ResilienceEvent::RetriesExhausted { .. } => &self.retries_exhausted,
            ResilienceEvent::DeadlineExceeded { .. } => &self.deadlines_exceeded,
            ResilienceEvent::NearTimeout { .. } => &self.near_timeouts,
            ResilienceEvent::AttemptTimedOut { .. } => &self.attempts_timed_out,
            ResilienceEvent::StateTransition { to: CircuitState::Open, .. } => &self.circuits_opened,
            ResilienceEvent::StateTransition { to: CircuitState::Closed, .. } => &self.circuits_closed,
            ResilienceEvent::StateTransition { .. } => return,
            ResilienceEvent::CallRejected { .. } => &self.calls_rejected,
            ResilienceEvent::FallbackInvoked { .. } => &self.fallbacks_invoked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps every event it receives, in order
///
/// Intended for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events recorded so far
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Names of the events recorded so far
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ResilienceEvent::name).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &ResilienceEvent) {
        self.events.lock().push(event.clone());
    }
}
