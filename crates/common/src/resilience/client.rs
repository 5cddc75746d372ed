//! Resilient client: breaker, retries, timeouts and fallback in one call
//!
//! For every call the client:
//!
//! 1. resolves the service's policy and applies per-call [`CallOptions`];
//!    an invalid policy fails the call before the breaker is consulted
//! 2. asks the [`CircuitBreakerRegistry`] for a permit; a rejection goes to
//!    the fallback or surfaces as [`ResilienceError::CircuitOpen`]
//! 3. runs the operation through the [`RetryExecutor`], each attempt bounded
//!    by a [`TimeoutGuard`]
//! 4. records the call's terminal outcome with the breaker, once
//! 5. hands a failure to the fallback, or returns it
//!
//! Retries are an attempt-level concern. The breaker only sees whether the
//! call as a whole succeeded.

use std::fmt;
use std::future::{ready, Future, Ready};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::backoff::{JitterSource, ThreadRngJitter};
use super::circuit_breaker::{CallOutcome, CircuitBreakerRegistry, CircuitStatus};
use super::clock::{Clock, SystemClock};
use super::config::ResilienceSettings;
use super::error::{ConfigResult, ResilienceError, ResilienceResult};
use super::events::{EventListener, ResilienceEvent, TracingListener};
use super::retry::{RetryError, RetryExecutor, RetryPolicy};
use super::timeout::{AttemptError, TimeoutGuard, TimeoutSpec};
use crate::error::Classify;

/// What an attempt knows about itself
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub service: Arc<str>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the attempt is abandoned: it ran past its time limit,
    /// the overall deadline expired, or the caller dropped the call
    pub cancellation: CancellationToken,
    /// Time limit for this attempt
    pub timeout: Duration,
}

/// Per-call overrides of the resolved service policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<TimeoutSpec>,
    /// Bound on the whole call, retries and delays included
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, spec: TimeoutSpec) -> Self {
        self.timeout = Some(spec);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

type NoFallback<T, E> = fn(ResilienceError<E>) -> Ready<T>;

/// Composition root for resilient calls
pub struct ResilientClient<C: Clock = SystemClock> {
    settings: Arc<ResilienceSettings>,
    breakers: Arc<CircuitBreakerRegistry<C>>,
    jitter: Arc<dyn JitterSource>,
    listener: Arc<dyn EventListener>,
}

impl<C: Clock> Clone for ResilientClient<C> {
    fn clone(&self) -> Self {
        Self {
            settings: Arc::clone(&self.settings),
            breakers: Arc::clone(&self.breakers),
            jitter: Arc::clone(&self.jitter),
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<C: Clock> fmt::Debug for ResilientClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("settings", &self.settings)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl ResilientClient<SystemClock> {
    /// Create a client with its own breaker registry
    pub fn new(settings: ResilienceSettings) -> ConfigResult<Self> {
        Self::builder().settings(settings).build()
    }

    pub fn builder() -> ResilientClientBuilder<SystemClock> {
        ResilientClientBuilder::new()
    }
}

impl<C: Clock> ResilientClient<C> {
    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry<C>> {
        &self.breakers
    }

    /// Breaker snapshot for a service
    pub fn status(&self, service: &str) -> CircuitStatus {
        self.breakers.get_status(service)
    }

    /// Run an operation under the service's policy
    pub async fn execute<F, Fut, T, E>(&self, service: &str, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + Send + Sync + 'static,
    {
        self.call(service, &CallOptions::default(), operation, None::<NoFallback<T, E>>).await
    }

    /// Run an operation and substitute the fallback's value on failure
    ///
    /// Only an invalid configuration is returned as an error.
    pub async fn execute_with_fallback<F, Fut, T, E, FB, FbFut>(
        &self,
        service: &str,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + Send + Sync + 'static,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = T>,
    {
        self.call(service, &CallOptions::default(), operation, Some(fallback)).await
    }

    /// Run an operation with per-call overrides
    pub async fn execute_with_options<F, Fut, T, E>(
        &self,
        service: &str,
        options: &CallOptions,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + Send + Sync + 'static,
    {
        self.call(service, options, operation, None::<NoFallback<T, E>>).await
    }

    /// Substitute a plain value on failure
    pub async fn execute_or<F, Fut, T, E>(
        &self,
        service: &str,
        operation: F,
        default: T,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + Send + Sync + 'static,
    {
        self.call(service, &CallOptions::default(), operation, Some(move |_| ready(default)))
            .await
    }

    /// The general form behind every `execute*` method
    #[instrument(skip_all, fields(service = %service))]
    pub async fn call<F, Fut, T, E, FB, FbFut>(
        &self,
        service: &str,
        options: &CallOptions,
        mut operation: F,
        fallback: Option<FB>,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + Send + Sync + 'static,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = T>,
    {
        let key: Arc<str> = Arc::from(service);
        let policy = self.settings.resolve(service);
        let retry = options.retry.clone().unwrap_or_else(|| policy.retry_policy());
        let timeout = options.timeout.unwrap_or_else(|| policy.timeout_spec());
        let breaker = policy.breaker_config();

        let validation = retry
            .validate()
            .and_then(|()| timeout.validate())
            .and_then(|()| breaker.validate());
        if let Err(err) = validation {
            return Err(ResilienceError::InvalidConfiguration {
                service: service.to_owned(),
                message: err.to_string(),
            });
        }

        let permit = match self.breakers.guard_with(service, &breaker) {
            Ok(permit) => permit,
            Err(rejection) => {
                let err = ResilienceError::CircuitOpen {
                    service: rejection.service,
                    retry_after: rejection.retry_after,
                };
                return self.recover(&key, err, fallback).await;
            }
        };

        let guard = TimeoutGuard::new(timeout)
            .with_label(Arc::clone(&key))
            .with_listener(Arc::clone(&self.listener));
        let mut executor = RetryExecutor::new(retry)
            .with_jitter(Arc::clone(&self.jitter))
            .with_listener(Arc::clone(&self.listener))
            .with_label(Arc::clone(&key));
        if let Some(deadline) = options.deadline {
            executor = executor.with_deadline(deadline);
        }

        let guard = &guard;
        let attempt_key = Arc::clone(&key);
        let result = executor
            .execute(move |attempt| {
                let cancellation = CancellationToken::new();
                let context = AttemptContext {
                    service: Arc::clone(&attempt_key),
                    attempt,
                    cancellation: cancellation.clone(),
                    timeout: guard.spec().timeout,
                };
                let attempt_future = operation(context);
                async move { guard.watch(attempt, cancellation, attempt_future).await.into_result() }
            })
            .await;

        self.breakers.record_outcome(permit, CallOutcome::of(&result));

        match result {
            Ok(value) => {
                debug!(service = %key, "Call succeeded");
                Ok(value)
            }
            Err(err) => {
                let err = into_resilience_error(service, err);
                self.recover(&key, err, fallback).await
            }
        }
    }

    async fn recover<T, E, FB, FbFut>(
        &self,
        service: &Arc<str>,
        error: ResilienceError<E>,
        fallback: Option<FB>,
    ) -> ResilienceResult<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = T>,
    {
        match fallback {
            Some(fallback) => {
                self.listener.on_event(&ResilienceEvent::FallbackInvoked {
                    service: Arc::clone(service),
                    reason: error.kind().as_str(),
                });
                Ok(fallback(error).await)
            }
            None => Err(error),
        }
    }
}

fn into_resilience_error<E>(service: &str, err: RetryError<AttemptError<E>>) -> ResilienceError<E>
where
    E: Classify + std::error::Error + Send + Sync + 'static,
{
    let service = service.to_owned();
    match err {
        RetryError::InvalidPolicy(err) => {
            ResilienceError::InvalidConfiguration { service, message: err.to_string() }
        }
        RetryError::Exhausted { attempts, last: AttemptError::Operation(source) } => {
            ResilienceError::Exhausted { service, attempts, kind: source.kind(), source }
        }
        RetryError::NonRetryable { attempt, source: AttemptError::Operation(source) } => {
            ResilienceError::NonRetryable { service, attempts: attempt, source }
        }
        RetryError::Exhausted { attempts, last: AttemptError::TimedOut { elapsed, limit } }
        | RetryError::NonRetryable {
            attempt: attempts,
            source: AttemptError::TimedOut { elapsed, limit },
        } => ResilienceError::TimedOut { service, attempts, elapsed, limit },
        RetryError::DeadlineExceeded { attempts, deadline, elapsed, last } => {
            let last = last.and_then(AttemptError::into_operation_error);
            ResilienceError::DeadlineExceeded { service, attempts, deadline, elapsed, last }
        }
    }
}

/// Builder for [`ResilientClient`]
pub struct ResilientClientBuilder<C: Clock = SystemClock> {
    settings: ResilienceSettings,
    clock: C,
    jitter: Arc<dyn JitterSource>,
    listener: Arc<dyn EventListener>,
    registry: Option<Arc<CircuitBreakerRegistry<C>>>,
}

impl ResilientClientBuilder<SystemClock> {
    pub fn new() -> Self {
        Self {
            settings: ResilienceSettings::default(),
            clock: SystemClock,
            jitter: Arc::new(ThreadRngJitter),
            listener: Arc::new(TracingListener),
            registry: None,
        }
    }
}

impl Default for ResilientClientBuilder<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> ResilientClientBuilder<C> {
    pub fn settings(mut self, settings: ResilienceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a custom clock for the breaker registry (for testing)
    pub fn clock<C2: Clock>(self, clock: C2) -> ResilientClientBuilder<C2> {
        ResilientClientBuilder {
            settings: self.settings,
            clock,
            jitter: self.jitter,
            listener: self.listener,
            registry: None,
        }
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Listener for retry, timeout, breaker and fallback events
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Share an existing registry instead of creating one
    pub fn registry(mut self, registry: Arc<CircuitBreakerRegistry<C>>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> ConfigResult<ResilientClient<C>> {
        self.settings.validate()?;

        let breakers = match self.registry {
            Some(registry) => registry,
            None => Arc::new(
                CircuitBreakerRegistry::with_clock(self.settings.defaults.breaker_config(), self.clock)?
                    .with_listener(Arc::clone(&self.listener)),
            ),
        };

        Ok(ResilientClient {
            settings: Arc::new(self.settings),
            breakers,
            jitter: self.jitter,
            listener: self.listener,
        })
    }
}
