//! Infrastructure error type
//!
//! Everything that can go wrong at the edges of the resilience layer:
//! reading and parsing configuration, talking HTTP, installing a subscriber.

mod conversions;

use std::path::PathBuf;

use bulwark_common::resilience::ConfigError;
use thiserror::Error;

use crate::http::HttpError;

/// Result alias for infrastructure operations
pub type InfraResult<T> = Result<T, InfraError>;

/// Errors raised by the infrastructure crate
#[derive(Debug, Error)]
pub enum InfraError {
    /// Configuration could not be located or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parsed but failed validation
    #[error(transparent)]
    Settings(#[from] ConfigError),

    /// A file could not be read
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP transport failure
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The global tracing subscriber could not be installed
    #[error("Failed to initialise tracing: {0}")]
    Tracing(String),
}

impl InfraError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
