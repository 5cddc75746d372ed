//! Retry executor with exponential backoff and jitter
//!
//! [`RetryExecutor`] invokes an operation until it succeeds, fails with an
//! error the policy does not retry, or runs out of attempts. Between attempts
//! it sleeps for [`delay_for`](super::backoff::delay_for); the sleep is a
//! `tokio` timer, so only the calling task waits and no lock is held.
//!
//! An optional overall deadline bounds the whole sequence: a retry whose delay
//! would overrun it is not scheduled, and an attempt still running when it
//! expires is dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::backoff::{delay_for, JitterSource, ThreadRngJitter};
use super::error::{ConfigError, ConfigResult};
use super::events::{EventListener, ResilienceEvent, TracingListener};
use crate::error::{Classify, ErrorKind};

/// Which error kinds are worth another attempt
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Every kind except [`ErrorKind::Permanent`]
    #[default]
    Transient,
    /// Every kind, including permanent failures
    All,
    /// Exactly the listed kinds
    Kinds(BTreeSet<ErrorKind>),
}

impl RetryOn {
    /// Build a kind set from any iterator of kinds
    pub fn kinds(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    /// Whether a failure of `kind` may be retried
    pub fn permits(&self, kind: ErrorKind) -> bool {
        match self {
            RetryOn::Transient => kind.is_transient(),
            RetryOn::All => true,
            RetryOn::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// Retry policy value object
///
/// Built per call site or resolved from service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Ceiling for any computed delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Apply ±10% random perturbation
    pub jitter: bool,
    /// Retryable error kinds
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retry_on: RetryOn::Transient,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder seeded with defaults
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// A policy that performs exactly one attempt
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }

        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "initial_delay",
                format!(
                    "({:?}) cannot be greater than max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            ));
        }

        Ok(())
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(false)
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.policy.retry_on = retry_on;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Errors that end a retry sequence
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The policy is invalid; no attempt was made
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[source] ConfigError),

    /// Every attempt failed with a retryable error
    #[error("all {attempts} attempt(s) failed")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    /// An attempt failed with an error the policy does not retry
    #[error("attempt {attempt} failed with a non-retryable error")]
    NonRetryable {
        attempt: u32,
        #[source]
        source: E,
    },

    /// The overall deadline expired
    #[error("deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32, deadline: Duration, elapsed: Duration, last: Option<E> },
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempts made before the sequence ended
    pub fn attempts(&self) -> u32 {
        match self {
            Self::InvalidPolicy(_) => 0,
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. } => *attempt,
        }
    }

    /// The failure observed on the final attempt
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::NonRetryable { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } => last.as_ref(),
            Self::InvalidPolicy(_) => None,
        }
    }

    /// Consume and return the failure observed on the final attempt
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::NonRetryable { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } => last,
            Self::InvalidPolicy(_) => None,
        }
    }
}

/// Outcome of a retry execution including summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + 'static,
{
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    pub total_delay: Duration,
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + 'static,
{
    /// Consume the outcome and return only the result
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Average delay between attempts (excludes operation execution time)
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// The retry executor
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
    listener: Arc<dyn EventListener>,
    label: Arc<str>,
    deadline: Option<Duration>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("label", &self.label)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Create an executor for a policy with thread-local jitter and tracing
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Arc::new(ThreadRngJitter),
            listener: Arc::new(TracingListener),
            label: Arc::from("operation"),
            deadline: None,
        }
    }

    /// Replace the jitter source
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the event listener
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Name used in logs and events
    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Bound the whole sequence, attempts and delays included
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an operation with retry logic
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics
    #[instrument(skip(self, operation), fields(label = %self.label, max_attempts = self.policy.max_attempts))]
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        let started = Instant::now();
        let mut attempt = 0;
        let mut total_delay = Duration::ZERO;

        let finish = |result, attempt, total_delay| RetryOutcome {
            result,
            attempts: attempt,
            total_delay,
            elapsed: started.elapsed(),
        };

        if let Err(err) = self.policy.validate() {
            warn!(label = %self.label, error = %err, "Rejecting invalid retry policy");
            return finish(Err(RetryError::InvalidPolicy(err)), 0, total_delay);
        }

        loop {
            attempt += 1;
            debug!(
                label = %self.label,
                attempt,
                max_attempts = self.policy.max_attempts,
                "Executing operation"
            );

            let result = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(started + deadline, operation(attempt)).await {
                        Ok(result) => result,
                        Err(_) => {
                            let err = self.deadline_exceeded(attempt, deadline, started, None);
                            return finish(Err(err), attempt, total_delay);
                        }
                    }
                }
                None => operation(attempt).await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label = %self.label, attempt, "Operation succeeded after retries");
                    }
                    return finish(Ok(value), attempt, total_delay);
                }
                Err(error) => error,
            };

            let kind = error.kind();
            if !self.policy.retry_on.permits(kind) {
                debug!(label = %self.label, attempt, %kind, "Failure is not retryable");
                return finish(
                    Err(RetryError::NonRetryable { attempt, source: error }),
                    attempt,
                    total_delay,
                );
            }

            if attempt >= self.policy.max_attempts {
                self.listener.on_event(&ResilienceEvent::RetriesExhausted {
                    service: Arc::clone(&self.label),
                    attempts: attempt,
                    kind,
                });
                return finish(
                    Err(RetryError::Exhausted { attempts: attempt, last: error }),
                    attempt,
                    total_delay,
                );
            }

            let delay = delay_for(attempt, &self.policy, self.jitter.as_ref());

            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay >= deadline {
                    let err = self.deadline_exceeded(attempt, deadline, started, Some(error));
                    return finish(Err(err), attempt, total_delay);
                }
            }

            self.listener.on_event(&ResilienceEvent::RetryScheduled {
                service: Arc::clone(&self.label),
                attempt,
                delay,
                kind,
            });

            tokio::time::sleep(delay).await;
            total_delay += delay;
        }
    }

    fn deadline_exceeded<E>(
        &self,
        attempts: u32,
        deadline: Duration,
        started: Instant,
        last: Option<E>,
    ) -> RetryError<E>
    where
        E: std::error::Error + 'static,
    {
        let elapsed = started.elapsed();
        self.listener.on_event(&ResilienceEvent::DeadlineExceeded {
            service: Arc::clone(&self.label),
            attempts,
            elapsed,
        });
        RetryError::DeadlineExceeded { attempts, deadline, elapsed, last }
    }
}

/// Convenience function to run an operation under a policy
pub async fn retry<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::error::Error + 'static,
{
    RetryExecutor::new(policy).execute(operation).await
}

#[cfg(test)]
mod tests {
    //! Unit tests for the retry executor
    //!
    //! Tests cover termination, success after failures, classification,
    //! policy validation, deadlines and the scheduled delays. Time is paused
    //! so sleeps complete instantly while `Instant` still advances.

    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::backoff::FixedJitter;
    use super::super::events::RecordingListener;
    use super::*;

    fn transient() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "reset")
    }

    fn permanent() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "denied")
    }

    fn fixed_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(10))
            .multiplier(2.0)
            .no_jitter()
            .build()
            .expect("valid policy")
    }

    #[test]
    fn test_retry_on_permits() {
        assert!(RetryOn::Transient.permits(ErrorKind::Timeout));
        assert!(!RetryOn::Transient.permits(ErrorKind::Permanent));
        assert!(RetryOn::All.permits(ErrorKind::Permanent));

        let only_network = RetryOn::kinds([ErrorKind::Network]);
        assert!(only_network.permits(ErrorKind::Network));
        assert!(!only_network.permits(ErrorKind::Timeout));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().multiplier(0.5).build().is_err());
        assert!(RetryPolicy::builder().multiplier(f64::NAN).build().is_err());
        assert!(RetryPolicy::builder()
            .initial_delay(Duration::from_secs(20))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_runs_max_attempts() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(4));

        let result: RetryResult<(), io::Error> = executor
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(io::Error::new(io::ErrorKind::ConnectionReset, format!("try {attempt}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last.to_string(), "try 4", "caller sees the final attempt's failure");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures_stops_retrying() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(5));

        let outcome = executor
            .execute_with_outcome(|_| {
                let seen = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if seen < 2 {
                        Err(transient())
                    } else {
                        Ok("ready")
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(1500));
        assert_eq!(outcome.average_delay(), Duration::from_millis(750));
        assert_eq!(outcome.into_result().expect("success"), "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_follow_backoff_schedule() {
        let recorder = Arc::new(RecordingListener::default());
        let executor = RetryExecutor::new(fixed_policy(5)).with_listener(recorder.clone());

        let started = Instant::now();
        let _: RetryResult<(), io::Error> = executor.execute(|_| async { Err(transient()) }).await;

        let delays: Vec<Duration> = recorder
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ResilienceEvent::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(7500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_uses_injected_source() {
        let policy = RetryPolicy { jitter: true, ..fixed_policy(2) };
        let executor = RetryExecutor::new(policy).with_jitter(Arc::new(FixedJitter(-1.0)));

        let outcome = executor
            .execute_with_outcome(|_| async { Err::<(), _>(transient()) })
            .await;

        assert_eq!(outcome.total_delay, Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_short_circuits() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(5));

        let started = Instant::now();
        let result: RetryResult<(), io::Error> = executor
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::NonRetryable { attempt: 1, .. })));
        assert_eq!(started.elapsed(), Duration::ZERO, "no delay after a terminal failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_all_retries_permanent_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { retry_on: RetryOn::All, ..fixed_policy(3) };

        let result: RetryResult<(), io::Error> = RetryExecutor::new(policy)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_never_sleeps() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: RetryResult<(), io::Error> = RetryExecutor::new(fixed_policy(1))
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_invalid_policy_fails_before_any_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };

        let result: RetryResult<(), io::Error> = RetryExecutor::new(policy)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(RetryError::InvalidPolicy(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_skips_delay_that_would_overrun() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fixed_policy(10)).with_deadline(Duration::from_millis(1200));

        let started = Instant::now();
        let result: RetryResult<(), io::Error> = executor
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        // 500ms after attempt 1, then the 1000ms delay after attempt 2 would overrun
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        match result {
            Err(RetryError::DeadlineExceeded { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(last.is_some());
            }
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_running_attempt() {
        let executor = RetryExecutor::new(fixed_policy(3)).with_deadline(Duration::from_secs(1));

        let result: RetryResult<(), io::Error> = executor
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        match result {
            Err(RetryError::DeadlineExceeded { attempts: 1, elapsed, last: None, .. }) => {
                assert_eq!(elapsed, Duration::from_secs(1));
            }
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleep_does_not_block_other_tasks() {
        let progress = Arc::new(AtomicU32::new(0));
        let ticker_progress = Arc::clone(&progress);

        let ticker = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ticker_progress.fetch_add(1, Ordering::SeqCst);
            }
        });

        let observed = Arc::clone(&progress);
        let result = RetryExecutor::new(fixed_policy(2))
            .execute(|attempt| {
                let observed = Arc::clone(&observed);
                async move {
                    if attempt == 1 {
                        Err(transient())
                    } else {
                        Ok(observed.load(Ordering::SeqCst))
                    }
                }
            })
            .await
            .expect("second attempt succeeds");

        ticker.await.unwrap();
        assert_eq!(result, 5, "the ticker kept running while the retry slept");
    }
}
