//! Per-service resilience configuration
//!
//! [`ResilienceSettings`] holds a default [`ServicePolicy`] plus sparse
//! [`ServiceOverrides`] keyed by service name. Resolving a service layers its
//! overrides onto the defaults. Durations are written in milliseconds:
//!
//! ```toml
//! [defaults]
//! timeout_ms = 5000
//! max_attempts = 3
//!
//! [services.billing]
//! timeout_ms = 1500
//! failure_threshold = 3
//! retry_on = { kinds = ["timeout", "server"] }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreakerConfig;
use super::error::{ConfigError, ConfigResult};
use super::retry::{RetryOn, RetryPolicy};
use super::timeout::{TimeoutSpec, DEFAULT_WARN_FRACTION};
use crate::utils::serde::{duration_millis, option_duration_millis};

/// Fully resolved configuration for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    /// Transport connection limit, consumed by transport adapters
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,
    pub warn_threshold_fraction: f64,
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub retry_on: RetryOn,
    pub failure_threshold: u32,
    #[serde(rename = "cooldown_ms", with = "duration_millis")]
    pub cooldown: Duration,
    pub half_open_max_trials: u32,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let breaker = CircuitBreakerConfig::default();
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            warn_threshold_fraction: DEFAULT_WARN_FRACTION,
            max_attempts: retry.max_attempts,
            initial_delay: retry.initial_delay,
            max_delay: retry.max_delay,
            multiplier: retry.multiplier,
            jitter: retry.jitter,
            retry_on: retry.retry_on,
            failure_threshold: breaker.failure_threshold,
            cooldown: breaker.cooldown,
            half_open_max_trials: breaker.half_open_max_trials,
        }
    }
}

impl ServicePolicy {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
        }
    }

    pub fn timeout_spec(&self) -> TimeoutSpec {
        TimeoutSpec { timeout: self.timeout, warn_threshold_fraction: self.warn_threshold_fraction }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
            half_open_max_trials: self.half_open_max_trials,
        }
    }

    /// Validate every policy derived from this configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry_policy().validate()?;
        self.timeout_spec().validate()?;
        self.breaker_config().validate()?;
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Sparse per-service overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverrides {
    #[serde(rename = "timeout_ms", with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(
        rename = "connect_timeout_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub connect_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_threshold_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(
        rename = "initial_delay_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_delay: Option<Duration>,
    #[serde(rename = "max_delay_ms", with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<RetryOn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(rename = "cooldown_ms", with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_max_trials: Option<u32>,
}

impl ServiceOverrides {
    /// Layer these overrides onto a base policy
    pub fn apply(&self, base: &ServicePolicy) -> ServicePolicy {
        ServicePolicy {
            timeout: self.timeout.unwrap_or(base.timeout),
            connect_timeout: self.connect_timeout.unwrap_or(base.connect_timeout),
            warn_threshold_fraction: self
                .warn_threshold_fraction
                .unwrap_or(base.warn_threshold_fraction),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay: self.initial_delay.unwrap_or(base.initial_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            jitter: self.jitter.unwrap_or(base.jitter),
            retry_on: self.retry_on.clone().unwrap_or_else(|| base.retry_on.clone()),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            cooldown: self.cooldown.unwrap_or(base.cooldown),
            half_open_max_trials: self.half_open_max_trials.unwrap_or(base.half_open_max_trials),
        }
    }
}

/// Defaults plus per-service overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub defaults: ServicePolicy,
    pub services: HashMap<String, ServiceOverrides>,
}

impl ResilienceSettings {
    pub fn new(defaults: ServicePolicy) -> Self {
        Self { defaults, services: HashMap::new() }
    }

    /// Register overrides for a service
    pub fn with_service(mut self, service: impl Into<String>, overrides: ServiceOverrides) -> Self {
        self.services.insert(service.into(), overrides);
        self
    }

    /// Configuration for a service key; unknown keys get the defaults
    pub fn resolve(&self, service: &str) -> ServicePolicy {
        match self.services.get(service) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// Validate the defaults and every configured service
    pub fn validate(&self) -> ConfigResult<()> {
        self.defaults.validate()?;

        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();
        for name in names {
            self.resolve(name).validate().map_err(|err| match err {
                ConfigError::Invalid { field, message } => ConfigError::Invalid {
                    field,
                    message: format!("{message} (service '{name}')"),
                },
            })?;
        }

        Ok(())
    }
}
