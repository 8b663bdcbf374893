//! Error types and handling
//!
//! This module provides the error types used throughout the foreman engine.
//! All errors implement the `ForemanErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.

use thiserror::Error;

/// Trait for foreman error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait ForemanErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// secrets (API keys, tokens) or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around by a later cycle.
    /// Non-recoverable errors require operator intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// This enum represents all possible errors that can occur in the foreman
/// engine, grouped by pipeline stage.
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: SQLite operation failures
/// - **Planning**: Goal decomposition failures
/// - **Assignment**: No agent covers a required role
/// - **Provider**: Model API failures, quota, timeouts
/// - **Extraction**: Task output that cannot become assets
/// - **Consistency**: Values that had to be clamped into a legal range
///
/// # Examples
///
/// ```
/// use foreman_engine::errors::{EngineError, ForemanErrorExt};
///
/// let error = EngineError::NoAgentsAvailable {
///     role: "researcher".to_string(),
/// };
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
///
/// let retryable = EngineError::ProviderTimeout;
/// assert!(retryable.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Planning errors
    #[error("Planning error: {0}")]
    Planning(String),

    // Assignment errors
    #[error("No agents available for role: {role}")]
    NoAgentsAvailable { role: String },

    // Provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider quota exhausted: {0}")]
    ProviderQuota(String),

    #[error("Provider call timed out")]
    ProviderTimeout,

    // Asset extraction errors
    #[error("Extraction error: {0}")]
    Extraction(String),

    // Consistency violations (clamped at the update point)
    #[error("Consistency violation: {0}")]
    Consistency(String),

    // Lookup errors
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Goal not found: {0}")]
    GoalNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Lifecycle errors
    #[error("Task {task_id} is terminal ({status}) and cannot transition")]
    TerminalStatus { task_id: String, status: String },

    #[error("Workspace lease held elsewhere: {0}")]
    LeaseUnavailable(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",

            // Database errors
            Self::Database(_) => "Database operation failed. Check the data directory",

            // Planning errors
            Self::Planning(_) => "Planning failed. The goal retries after its cooldown",

            // Assignment errors
            Self::NoAgentsAvailable { .. } => {
                "No agent covers this role. Add one with 'foreman init --agent'"
            }

            // Provider errors
            Self::Provider(_) => "Provider unavailable. Check your API keys and network",
            Self::ProviderQuota(_) => "Provider quota exhausted. Wait before retrying",
            Self::ProviderTimeout => "Provider took too long to respond. Try again",

            // Asset extraction errors
            Self::Extraction(_) => "Task output could not be converted into assets",

            // Consistency violations
            Self::Consistency(_) => "Stored values were clamped into a consistent range",

            // Lookup errors
            Self::WorkspaceNotFound(_) => "Unknown workspace. List workspaces with 'foreman status'",
            Self::GoalNotFound(_) => "Unknown goal id for this workspace",
            Self::TaskNotFound(_) => "Unknown task id for this workspace",

            // Lifecycle errors
            Self::TerminalStatus { .. } => "Task already finished and cannot change state",
            Self::LeaseUnavailable(_) => "Workspace busy in another cycle. Try again shortly",

            // IO errors
            Self::Io(_) => "File system operation failed. Check permissions",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Recoverable: a later cycle or retry can succeed
            Self::Planning(_)
            | Self::Provider(_)
            | Self::ProviderQuota(_)
            | Self::ProviderTimeout
            | Self::Extraction(_)
            | Self::Consistency(_)
            | Self::LeaseUnavailable(_) => true,

            // Non-recoverable: requires operator action
            Self::Config(_)
            | Self::Database(_)
            | Self::NoAgentsAvailable { .. }
            | Self::WorkspaceNotFound(_)
            | Self::GoalNotFound(_)
            | Self::TaskNotFound(_)
            | Self::TerminalStatus { .. }
            | Self::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_errors_are_recoverable() {
        assert!(EngineError::ProviderTimeout.is_recoverable());
        assert!(EngineError::Provider("503".to_string()).is_recoverable());
        assert!(EngineError::ProviderQuota("429".to_string()).is_recoverable());
    }

    #[test]
    fn test_assignment_error_is_terminal() {
        let err = EngineError::NoAgentsAvailable {
            role: "researcher".to_string(),
        };
        assert!(!err.is_recoverable());
        assert!(err.user_hint().contains("foreman init"));
    }

    #[test]
    fn test_terminal_status_message_names_task() {
        let err = EngineError::TerminalStatus {
            task_id: "t-1".to_string(),
            status: "completed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("t-1"));
        assert!(msg.contains("completed"));
    }

    #[test]
    fn test_every_error_has_nonempty_hint() {
        let samples = vec![
            EngineError::Config("x".to_string()),
            EngineError::Database("x".to_string()),
            EngineError::Planning("x".to_string()),
            EngineError::Extraction("x".to_string()),
            EngineError::Consistency("x".to_string()),
            EngineError::WorkspaceNotFound("x".to_string()),
            EngineError::LeaseUnavailable("x".to_string()),
        ];
        for err in samples {
            assert!(!err.user_hint().is_empty());
        }
    }
}
