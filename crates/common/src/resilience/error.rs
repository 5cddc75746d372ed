//! Call-level failure taxonomy
//!
//! [`ResilienceError`] is what a caller of the resilient client sees when a
//! call produces no value. It wraps the operation's own error where there is
//! one, and always names the service key; failures that happen after at least
//! one attempt also carry the attempt count.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub use crate::error::{Classify, ErrorKind};
use crate::error::{CommonError, ErrorClassification, ErrorSeverity};

/// Call-level failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Retryable failure that survived every attempt
    Transient,
    /// Non-retryable failure, retries were short-circuited
    Permanent,
    /// Rejected by the circuit breaker without attempting the operation
    CircuitOpen,
    /// An attempt or the overall deadline ran out of time
    Timeout,
    /// Invalid policy, detected before any attempt
    Configuration,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Timeout => "timeout",
            FailureKind::Configuration => "configuration",
        }
    }
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Permanent => FailureKind::Permanent,
            ErrorKind::Timeout => FailureKind::Timeout,
            ErrorKind::Transient
            | ErrorKind::Network
            | ErrorKind::RateLimited
            | ErrorKind::Server => FailureKind::Transient,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors surfaced by the resilient client
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The breaker rejected the call
    #[error("circuit breaker for '{service}' is open")]
    CircuitOpen { service: String, retry_after: Option<Duration> },

    /// Every attempt failed with a retryable error
    #[error("'{service}' failed after {attempts} attempt(s)")]
    Exhausted {
        service: String,
        attempts: u32,
        /// Classification of the final failure
        kind: ErrorKind,
        #[source]
        source: E,
    },

    /// An attempt failed with an error the policy does not retry
    #[error("'{service}' failed with a non-retryable error on attempt {attempts}")]
    NonRetryable {
        service: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The terminal attempt exceeded its time limit
    #[error("'{service}' timed out on attempt {attempts} after {elapsed:?} (limit {limit:?})")]
    TimedOut { service: String, attempts: u32, elapsed: Duration, limit: Duration },

    /// The overall deadline expired before the call could finish
    #[error("'{service}' exceeded its deadline of {deadline:?} after {attempts} attempt(s)")]
    DeadlineExceeded {
        service: String,
        attempts: u32,
        deadline: Duration,
        elapsed: Duration,
        /// Failure of the last completed attempt, if one completed
        #[source]
        last: Option<E>,
    },

    /// The resolved policy is invalid
    #[error("invalid resilience configuration for '{service}': {message}")]
    InvalidConfiguration { service: String, message: String },
}

/// Result type for resilient calls
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Call-level category of this failure
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Exhausted { kind, .. } => FailureKind::from(*kind),
            Self::NonRetryable { .. } => FailureKind::Permanent,
            Self::TimedOut { .. } | Self::DeadlineExceeded { .. } => FailureKind::Timeout,
            Self::InvalidConfiguration { .. } => FailureKind::Configuration,
        }
    }

    /// Service key the call targeted
    pub fn service(&self) -> &str {
        match self {
            Self::CircuitOpen { service, .. }
            | Self::Exhausted { service, .. }
            | Self::NonRetryable { service, .. }
            | Self::TimedOut { service, .. }
            | Self::DeadlineExceeded { service, .. }
            | Self::InvalidConfiguration { service, .. } => service,
        }
    }

    /// Attempts made before the failure surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::TimedOut { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::CircuitOpen { .. } | Self::InvalidConfiguration { .. } => 0,
        }
    }

    /// The operation's own error, when the failure came from the operation
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } => last.as_ref(),
            _ => None,
        }
    }

    /// Consume and return the operation's own error
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } => last,
            _ => None,
        }
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transient | FailureKind::CircuitOpen | FailureKind::Timeout)
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            FailureKind::CircuitOpen | FailureKind::Timeout => ErrorSeverity::Warning,
            FailureKind::Transient | FailureKind::Permanent | FailureKind::Configuration => {
                ErrorSeverity::Error
            }
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl<E> From<ResilienceError<E>> for CommonError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: ResilienceError<E>) -> Self {
        match err {
            ResilienceError::CircuitOpen { service, retry_after } => {
                CommonError::CircuitBreakerOpen { service, retry_after }
            }
            ResilienceError::TimedOut { service, limit, .. } => CommonError::timeout(service, limit),
            ResilienceError::DeadlineExceeded { service, deadline, .. } => {
                CommonError::timeout(service, deadline)
            }
            ResilienceError::InvalidConfiguration { service, message } => {
                CommonError::config_field(service, message)
            }
            ResilienceError::Exhausted { service, source, .. } => {
                CommonError::backend(service, source.to_string(), true)
            }
            ResilienceError::NonRetryable { service, source, .. } => {
                CommonError::backend(service, source.to_string(), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_kind_and_accessors() {
        let err: ResilienceError<io::Error> = ResilienceError::Exhausted {
            service: "billing".into(),
            attempts: 3,
            kind: ErrorKind::Transient,
            source: io::Error::other("boom"),
        };

        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(err.service(), "billing");
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.source_error().map(ToString::to_string).as_deref(), Some("boom"));
        assert_eq!(err.to_string(), "'billing' failed after 3 attempt(s)");
    }

    #[test]
    fn test_exhausted_kind_follows_last_failure() {
        let exhausted = |kind| -> ResilienceError<io::Error> {
            ResilienceError::Exhausted {
                service: "billing".into(),
                attempts: 2,
                kind,
                source: io::Error::other("boom"),
            }
        };

        assert_eq!(exhausted(ErrorKind::Permanent).kind(), FailureKind::Permanent);
        assert_eq!(exhausted(ErrorKind::Timeout).kind(), FailureKind::Timeout);
        assert_eq!(exhausted(ErrorKind::Server).kind(), FailureKind::Transient);
        assert_eq!(exhausted(ErrorKind::RateLimited).kind(), FailureKind::Transient);
    }

    #[test]
    fn test_deadline_keeps_last_failure() {
        let err: ResilienceError<io::Error> = ResilienceError::DeadlineExceeded {
            service: "billing".into(),
            attempts: 2,
            deadline: Duration::from_secs(1),
            elapsed: Duration::from_millis(900),
            last: Some(io::Error::other("upstream down")),
        };

        assert_eq!(err.kind(), FailureKind::Timeout);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("upstream down"));
        assert_eq!(err.into_source().map(|e| e.to_string()).as_deref(), Some("upstream down"));
    }

    #[test]
    fn test_circuit_open_has_no_attempts() {
        let err: ResilienceError<io::Error> = ResilienceError::CircuitOpen {
            service: "search".into(),
            retry_after: Some(Duration::from_secs(4)),
        };

        assert_eq!(err.kind(), FailureKind::CircuitOpen);
        assert_eq!(err.attempts(), 0);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
        assert!(err.into_source().is_none());
    }

    #[test]
    fn test_conversion_into_common_error() {
        let err: ResilienceError<io::Error> = ResilienceError::NonRetryable {
            service: "users".into(),
            attempts: 1,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        let common = CommonError::from(err);
        assert!(!common.is_retryable());
        assert!(common.to_string().contains("users"));

        let timeout: ResilienceError<io::Error> = ResilienceError::TimedOut {
            service: "users".into(),
            attempts: 2,
            elapsed: Duration::from_millis(120),
            limit: Duration::from_millis(100),
        };
        assert!(matches!(CommonError::from(timeout), CommonError::Timeout { .. }));
    }

    #[test]
    fn test_configuration_failures_are_not_retryable() {
        let err: ResilienceError<io::Error> = ResilienceError::InvalidConfiguration {
            service: "users".into(),
            message: "max_attempts must be greater than 0".into(),
        };
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert!(!err.is_retryable());
    }
}
