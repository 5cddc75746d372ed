//! Shared building blocks for Bulwark crates.
//!
//! # Safety and Quality
//!
//! This crate enforces strict safety and quality standards; it forbids
//! `unsafe` code and never panics on lock poisoning.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error vocabulary and serde helpers
//! - `observability`: tracing integration
//! - `runtime`: the resilience execution layer
//!
//! No tier is enabled by default.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{Classify, CommonError, CommonResult, ErrorClassification, ErrorKind, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    CallOptions, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus,
    FailureKind, ResilienceError, ResilienceResult, ResilienceSettings, ResilientClient,
    RetryError, RetryExecutor, RetryPolicy, ServicePolicy, TimeoutGuard, TimeoutSpec,
};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
