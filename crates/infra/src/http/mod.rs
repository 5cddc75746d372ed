//! HTTP transport running every request through the resilient client

pub mod client;
pub mod error;

pub use client::ResilientHttpClient;
pub use error::HttpError;
