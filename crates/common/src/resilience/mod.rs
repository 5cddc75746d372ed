//! Resilience execution layer
//!
//! Components, leaf first:
//!
//! - [`backoff`]: delay before the next attempt, with injectable jitter
//! - [`retry`]: runs an operation until it succeeds, fails permanently, or
//!   runs out of attempts
//! - [`circuit_breaker`]: one Closed/Open/HalfOpen state machine per service
//!   key, gating whether an operation is attempted at all
//! - [`timeout`]: bounds a single attempt and reports near-timeouts
//! - [`client`]: the composition of all of the above plus fallbacks
//!
//! [`config`] resolves per-service policy; [`events`] carries everything the
//! layer observes to logs and counters.
//!
//! ```no_run
//! use bulwark_common::resilience::{ResilienceSettings, ResilientClient};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ResilientClient::new(ResilienceSettings::default())?;
//! let body = client
//!     .execute_with_fallback(
//!         "inventory",
//!         |_ctx| async { Ok::<_, std::io::Error>(String::from("fresh")) },
//!         |_err| async { String::from("cached") },
//!     )
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod timeout;

pub use backoff::{base_delay, delay_for, FixedJitter, JitterSource, SeededJitter, ThreadRngJitter};
pub use circuit_breaker::{
    CallOutcome, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerRegistry,
    CircuitState, CircuitStatus, Permit, Rejection,
};
pub use client::{AttemptContext, CallOptions, ResilientClient, ResilientClientBuilder};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ResilienceSettings, ServiceOverrides, ServicePolicy};
pub use error::{
    Classify, ConfigError, ConfigResult, ErrorKind, FailureKind, ResilienceError, ResilienceResult,
};
pub use events::{
    EventListener, Listeners, MetricsRecorder, MetricsSnapshot, NoopListener, RecordingListener,
    ResilienceEvent, TracingListener,
};
pub use retry::{
    retry, RetryError, RetryExecutor, RetryOn, RetryOutcome, RetryPolicy, RetryPolicyBuilder,
    RetryResult,
};
pub use timeout::{AttemptError, Outcome, TimeoutGuard, TimeoutSpec};
