//! HTTP failure classification

use bulwark_common::{Classify, ErrorKind};
use reqwest::StatusCode;
use thiserror::Error;

/// A failed HTTP attempt
#[derive(Debug, Error)]
pub enum HttpError {
    /// The server answered with a 4xx or 5xx status
    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    /// No connection could be established
    #[error("Connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    /// The transport gave up waiting
    #[error("Request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    /// The request could not be built (bad URL, invalid header)
    #[error("Invalid request: {0}")]
    Build(#[source] reqwest::Error),

    /// Streaming bodies cannot be replayed across attempts
    #[error("Request body cannot be cloned; buffer the body to enable retries")]
    UnclonableRequest,

    /// Any other transport failure (reset, protocol error, body read)
    #[error("HTTP transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl HttpError {
    /// Status code when the server answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout(err)
        } else if err.is_connect() {
            HttpError::Connect(err)
        } else if err.is_builder() {
            HttpError::Build(err)
        } else {
            HttpError::Transport(err)
        }
    }
}

/// Kind for a non-success status
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        s if s.is_server_error() => ErrorKind::Server,
        _ => ErrorKind::Permanent,
    }
}

impl Classify for HttpError {
    fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Status { status, .. } => classify_status(*status),
            HttpError::Connect(_) => ErrorKind::Network,
            HttpError::Timeout(_) => ErrorKind::Timeout,
            HttpError::Transport(_) => ErrorKind::Transient,
            HttpError::Build(_) | HttpError::UnclonableRequest => ErrorKind::Permanent,
        }
    }
}
