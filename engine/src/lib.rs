//! Foreman Engine Library
//!
//! This library provides the core functionality of the Foreman engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Error types and handling
pub mod errors;

/// Event bus for pipeline notifications
pub mod events;

/// Goal pipeline: planning, execution, quality, aggregation
pub mod pipeline;

/// Model provider abstraction layer
pub mod provider;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

#[cfg(test)]
pub(crate) mod test_support;
