//! Common error types and classification shared across Bulwark crates
//!
//! This module provides the error vocabulary every caller of the resilience
//! layer speaks. It has three parts:
//!
//! 1. **`ErrorKind` + `Classify`**: the classifier attached to every failure
//!    of a wrapped operation. The retry executor consults the kind to decide
//!    whether another attempt is worthwhile.
//!
//! 2. **`CommonError`**: standard error patterns (configuration, timeouts,
//!    backend failures, open circuits) for modules that do not need a
//!    dedicated error enum.
//!
//! 3. **`ErrorClassification` + `ErrorSeverity`**: retryability and severity
//!    for monitoring and alerting.
//!
//! ## Classifying operation errors
//!
//! ```rust
//! use bulwark_common::error::{Classify, ErrorKind};
//!
//! #[derive(Debug)]
//! enum LookupError {
//!     Unreachable,
//!     Rejected,
//! }
//!
//! impl Classify for LookupError {
//!     fn kind(&self) -> ErrorKind {
//!         match self {
//!             Self::Unreachable => ErrorKind::Network,
//!             Self::Rejected => ErrorKind::Permanent,
//!         }
//!     }
//! }
//!
//! assert!(LookupError::Unreachable.kind().is_transient());
//! assert!(!LookupError::Rejected.kind().is_transient());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Classifier attached to a failed attempt of a wrapped operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Generic transient failure, worth another attempt
    Transient,
    /// Permanent failure, another attempt will fail the same way
    Permanent,
    /// The attempt ran out of time
    Timeout,
    /// Connection could not be established or was reset
    Network,
    /// The dependency asked us to slow down
    RateLimited,
    /// The dependency reported an internal failure
    Server,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Transient,
        ErrorKind::Permanent,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::RateLimited,
        ErrorKind::Server,
    ];

    /// Every kind except `Permanent` is transient
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    /// Stable snake_case name used in logs and configuration
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto an [`ErrorKind`]
///
/// Every operation wrapped by the resilience layer fails with an error type
/// implementing this trait.
pub trait Classify {
    /// The classifier for this error
    fn kind(&self) -> ErrorKind;
}

impl<T: Classify + ?Sized> Classify for &T {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match std::io::Error::kind(self) {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => ErrorKind::Network,
            Io::Interrupted | Io::WouldBlock | Io::UnexpectedEof | Io::Other => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Permanent,
        }
    }
}

/// Common error variants that appear across multiple modules
///
/// This enum provides standardized error types that can be embedded in
/// module-specific error enums to ensure consistency across the application.
#[derive(Debug, Clone)]
pub enum CommonError {
    /// Configuration-related errors
    Config { message: String, field: Option<String> },

    /// Circuit breaker is open, preventing operations
    CircuitBreakerOpen { service: String, retry_after: Option<Duration> },

    /// Timeout errors
    Timeout { operation: String, duration: Duration },

    /// Network or backend connectivity errors
    Backend { service: String, message: String, is_retryable: bool },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::CircuitBreakerOpen { service, retry_after } => {
                if let Some(retry) = retry_after {
                    write!(f, "Circuit breaker open for '{}' (retry in {:?})", service, retry)
                } else {
                    write!(f, "Circuit breaker open for '{}'", service)
                }
            }
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::Backend { service, message, .. } => {
                write!(f, "Backend error from '{}': {}", service, message)
            }
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. } => true,
            Self::Timeout { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            Self::Config { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config { .. } => ErrorSeverity::Error,
            Self::CircuitBreakerOpen { .. } => ErrorSeverity::Warning,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Backend { .. } => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl Classify for CommonError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Backend { is_retryable: true, .. } => ErrorKind::Server,
            Self::CircuitBreakerOpen { .. } => ErrorKind::Transient,
            Self::Backend { is_retryable: false, .. } | Self::Config { .. } => ErrorKind::Permanent,
        }
    }
}

impl CommonError {
    /// Create a configuration error for a specific field
    pub fn config_field<S: Into<String>, F: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    /// Convert error to structured logging fields
    ///
    /// Returns key-value pairs suitable for structured logging.
    pub fn as_tracing_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("error_type", self.error_type_name().to_string())];

        match self {
            Self::Config { message, field } => {
                fields.push(("message", message.clone()));
                if let Some(field) = field {
                    fields.push(("field", field.clone()));
                }
            }
            Self::CircuitBreakerOpen { service, retry_after } => {
                fields.push(("service", service.clone()));
                if let Some(retry) = retry_after {
                    fields.push(("retry_after_ms", retry.as_millis().to_string()));
                }
            }
            Self::Timeout { operation, duration } => {
                fields.push(("operation", operation.clone()));
                fields.push(("duration_ms", duration.as_millis().to_string()));
            }
            Self::Backend { service, message, is_retryable } => {
                fields.push(("service", service.clone()));
                fields.push(("message", message.clone()));
                fields.push(("is_retryable", is_retryable.to_string()));
            }
        }

        fields
    }

    fn error_type_name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::Timeout { .. } => "timeout",
            Self::Backend { .. } => "backend",
        }
    }
}

/// Error classification trait for consistent error handling across modules
///
/// Provides retryability and severity so monitoring, alerting and callers
/// that do not use the retry executor can still make consistent decisions.
pub trait ErrorClassification {
    /// Check if this error is retryable
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific delay is recommended (e.g. the
    /// remaining cooldown of an open circuit).
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the shared error vocabulary
    //!
    //! Tests cover classifier mapping, display formatting, retryability,
    //! severity, and structured logging fields.

    use super::*;

    #[test]
    fn test_error_kind_transient_partition() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.is_transient(), kind != ErrorKind::Permanent, "kind {kind}");
        }
    }

    #[test]
    fn test_error_kind_serde_names() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");

        let kind: ErrorKind = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(kind, ErrorKind::Server);
        assert_eq!(kind.to_string(), "server");
    }

    #[test]
    fn test_io_error_classification() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
        let other = std::io::Error::other("flaky");
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");

        assert_eq!(Classify::kind(&timed_out), ErrorKind::Timeout);
        assert_eq!(Classify::kind(&refused), ErrorKind::Network);
        assert_eq!(Classify::kind(&other), ErrorKind::Transient);
        assert_eq!(Classify::kind(&denied), ErrorKind::Permanent);
    }

    #[test]
    fn test_error_config_with_field() {
        let err = CommonError::config_field("max_attempts", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Configuration error in field 'max_attempts': must be greater than 0"
        );
        assert!(!err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_error_circuit_breaker_with_retry() {
        let err = CommonError::CircuitBreakerOpen {
            service: "billing".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(err.to_string().contains("billing"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_error_backend_classification() {
        let retryable = CommonError::backend("users", "503", true);
        let fatal = CommonError::backend("users", "400", false);

        assert_eq!(retryable.kind(), ErrorKind::Server);
        assert_eq!(fatal.kind(), ErrorKind::Permanent);
        assert!(retryable.is_retryable());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_error_timeout_classification() {
        let err = CommonError::timeout("fetch_profile", Duration::from_millis(250));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Operation 'fetch_profile' timed out after 250ms");
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    #[test]
    fn test_as_tracing_fields() {
        let err = CommonError::CircuitBreakerOpen {
            service: "search".into(),
            retry_after: Some(Duration::from_millis(1500)),
        };
        let fields = err.as_tracing_fields();

        assert_eq!(fields[0], ("error_type", "circuit_breaker_open".to_string()));
        assert!(fields.contains(&("service", "search".to_string())));
        assert!(fields.contains(&("retry_after_ms", "1500".to_string())));
    }
}
