//! # Bulwark Infrastructure
//!
//! The impure edges of the resilience layer.
//!
//! This crate contains:
//! - Configuration loading from environment variables and files
//! - An HTTP transport that runs every request through the resilient client
//! - Tracing subscriber initialisation
//!
//! ## Architecture
//! - Builds on the policies and state machines in `bulwark-common`
//! - Contains all code that touches the network, the filesystem or the
//!   process environment

pub mod config;
pub mod errors;
pub mod http;
pub mod observability;

// Re-export commonly used items
pub use errors::{InfraError, InfraResult};
pub use http::{HttpError, ResilientHttpClient};
pub use observability::{init_tracing, LogFormat};
