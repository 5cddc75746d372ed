//! Per-attempt time limits
//!
//! [`TimeoutGuard`] bounds a single attempt in two ways:
//!
//! - **Preemptive** ([`TimeoutGuard::watch`]): the attempt future is raced
//!   against a `tokio` timer and dropped when the limit passes. The attempt's
//!   [`CancellationToken`] is cancelled at the same time, so work it spawned
//!   elsewhere can stop too.
//! - **Measured**: once an attempt returns, its elapsed time is compared with
//!   the limit. A result that arrives at or after the limit is discarded and
//!   reported as [`Outcome::TimedOut`]. This is the only protection for code
//!   that blocks without yielding; such code cannot be interrupted, only
//!   detected. [`TimeoutGuard::measure`] applies this check to synchronous
//!   closures.
//!
//! An attempt that finishes past `warn_threshold_fraction` of the limit emits a
//! near-timeout event but still succeeds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{ConfigError, ConfigResult};
use super::events::{EventListener, ResilienceEvent, TracingListener};
use crate::error::{Classify, ErrorKind};

/// Default fraction of the limit after which a near-timeout is reported
pub const DEFAULT_WARN_FRACTION: f64 = 0.8;

/// Time limit for one attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutSpec {
    pub timeout: Duration,
    pub warn_threshold_fraction: f64,
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(5), warn_threshold_fraction: DEFAULT_WARN_FRACTION }
    }
}

impl TimeoutSpec {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, ..Self::default() }
    }

    pub fn with_warn_threshold(mut self, fraction: f64) -> Self {
        self.warn_threshold_fraction = fraction;
        self
    }

    /// Elapsed time past which a near-timeout is reported
    pub fn warn_threshold(&self) -> Duration {
        self.timeout.mul_f64(self.warn_threshold_fraction.clamp(0.0, 1.0))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than 0"));
        }

        let fraction = self.warn_threshold_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "warn_threshold_fraction",
                format!("must be within (0, 1], got {fraction}"),
            ));
        }

        Ok(())
    }
}

/// Result of one guarded attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T, E> {
    Success(T),
    Failure { kind: ErrorKind, error: E },
    TimedOut { elapsed: Duration, limit: Duration },
}

impl<T, E: Classify> Outcome<T, E> {
    /// Classify an operation result
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Failure { kind: error.kind(), error },
        }
    }
}

impl<T, E> Outcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut { .. })
    }

    /// Error kind of a failed attempt; timeouts report [`ErrorKind::Timeout`]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::TimedOut { .. } => Some(ErrorKind::Timeout),
        }
    }
}

impl<T, E> Outcome<T, E>
where
    E: std::error::Error + 'static,
{
    pub fn into_result(self) -> Result<T, AttemptError<E>> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure { error, .. } => Err(AttemptError::Operation(error)),
            Outcome::TimedOut { elapsed, limit } => Err(AttemptError::TimedOut { elapsed, limit }),
        }
    }
}

/// Failure of one guarded attempt
#[derive(Debug, Error)]
pub enum AttemptError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation itself failed
    #[error(transparent)]
    Operation(E),

    /// The attempt ran past its limit
    #[error("attempt timed out after {elapsed:?} (limit {limit:?})")]
    TimedOut { elapsed: Duration, limit: Duration },
}

impl<E> AttemptError<E>
where
    E: std::error::Error + 'static,
{
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            AttemptError::Operation(error) => Some(error),
            AttemptError::TimedOut { .. } => None,
        }
    }
}

impl<E> Classify for AttemptError<E>
where
    E: Classify + std::error::Error + 'static,
{
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Operation(error) => error.kind(),
            AttemptError::TimedOut { .. } => ErrorKind::Timeout,
        }
    }
}

/// Enforces a [`TimeoutSpec`] on individual attempts
#[derive(Clone)]
pub struct TimeoutGuard {
    spec: TimeoutSpec,
    listener: Arc<dyn EventListener>,
    label: Arc<str>,
}

impl std::fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("spec", &self.spec)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl TimeoutGuard {
    pub fn new(spec: TimeoutSpec) -> Self {
        Self { spec, listener: Arc::new(TracingListener), label: Arc::from("operation") }
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn spec(&self) -> &TimeoutSpec {
        &self.spec
    }

    /// Run an operation that receives its own cancellation token
    pub async fn run<F, Fut, T, E>(&self, attempt: u32, operation: F) -> Outcome<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let cancellation = CancellationToken::new();
        let future = operation(cancellation.clone());
        self.watch(attempt, cancellation, future).await
    }

    /// Race an attempt future against the limit
    ///
    /// `cancellation` is cancelled unless the attempt completes: when the
    /// limit passes first, and when this future is dropped mid-attempt (an
    /// outer deadline, or the caller giving up).
    pub async fn watch<Fut, T, E>(
        &self,
        attempt: u32,
        cancellation: CancellationToken,
        future: Fut,
    ) -> Outcome<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let cancel_on_drop = cancellation.drop_guard();
        let started = Instant::now();
        let raced = tokio::time::timeout(self.spec.timeout, future).await;
        let elapsed = started.elapsed();

        match raced {
            Ok(result) => {
                cancel_on_drop.disarm();
                self.judge(attempt, elapsed, result)
            }
            Err(_) => {
                drop(cancel_on_drop);
                self.timed_out(attempt, elapsed)
            }
        }
    }

    /// Time a synchronous operation
    ///
    /// The closure always runs to completion; an overrun is detected
    /// afterwards.
    pub fn measure<F, T, E>(&self, attempt: u32, operation: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Classify,
    {
        let started = std::time::Instant::now();
        let result = operation();
        self.judge(attempt, started.elapsed(), result)
    }

    fn judge<T, E: Classify>(&self, attempt: u32, elapsed: Duration, result: Result<T, E>) -> Outcome<T, E> {
        if elapsed >= self.spec.timeout {
            return self.timed_out(attempt, elapsed);
        }

        if elapsed > self.spec.warn_threshold() {
            self.listener.on_event(&ResilienceEvent::NearTimeout {
                service: Arc::clone(&self.label),
                attempt,
                elapsed,
                limit: self.spec.timeout,
            });
        }

        Outcome::from_result(result)
    }

    fn timed_out<T, E>(&self, attempt: u32, elapsed: Duration) -> Outcome<T, E> {
        self.listener.on_event(&ResilienceEvent::AttemptTimedOut {
            service: Arc::clone(&self.label),
            attempt,
            elapsed,
            limit: self.spec.timeout,
        });
        Outcome::TimedOut { elapsed, limit: self.spec.timeout }
    }
}
