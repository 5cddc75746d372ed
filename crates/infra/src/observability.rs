//! Tracing subscriber initialisation
//!
//! The resilience layer reports through `tracing`; this installs a global
//! subscriber so those records end up somewhere. `RUST_LOG` wins over the
//! default directive.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::errors::{InfraError, InfraResult};

/// Selects the log format at startup
pub const LOG_FORMAT_VAR: &str = "BULWARK_LOG_FORMAT";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event, with span close timings
    Json,
}

impl LogFormat {
    /// Format named by `BULWARK_LOG_FORMAT`, falling back to [`LogFormat::Pretty`]
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_VAR).ok().and_then(|raw| raw.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for LogFormat {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "compact" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(InfraError::config(format!("Unknown log format: {other}"))),
        }
    }
}

/// Install the global tracing subscriber
///
/// `default_directive` applies when `RUST_LOG` is unset, e.g.
/// `"bulwark_common=info,bulwark_infra=info"`.
///
/// # Errors
/// Returns `InfraError::Tracing` if the directive is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(default_directive: &str, format: LogFormat) -> InfraResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| InfraError::Tracing(format!("Failed to create log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::NONE).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| InfraError::Tracing(e.to_string()))
}
