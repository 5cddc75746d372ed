//! Conversions from external errors into [`InfraError`], and its
//! classification for the retry layer.

use bulwark_common::{Classify, ErrorKind};

use super::InfraError;
use crate::http::HttpError;

impl From<toml::de::Error> for InfraError {
    fn from(err: toml::de::Error) -> Self {
        InfraError::config(format!("Invalid TOML format: {err}"))
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        InfraError::config(format!("Invalid JSON format: {err}"))
    }
}

impl From<reqwest::Error> for InfraError {
    fn from(err: reqwest::Error) -> Self {
        InfraError::Http(HttpError::from(err))
    }
}

impl Classify for InfraError {
    fn kind(&self) -> ErrorKind {
        match self {
            InfraError::Http(err) => err.kind(),
            InfraError::Io { source, .. } => Classify::kind(source),
            InfraError::Config(_) | InfraError::Settings(_) | InfraError::Tracing(_) => {
                ErrorKind::Permanent
            }
        }
    }
}
