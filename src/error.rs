//! Error types for the admin task service.

use crate::tasks::model::TaskId;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request-time task errors. Each maps to a 4xx/5xx response before any
/// task state is touched or any stream is opened.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unsupported task: {0}")]
    UnsupportedTask(String),

    #[error("Missing task scope")]
    MissingScope,

    #[error("Invalid options for task {task}: {reason}")]
    InvalidOptions { task: String, reason: String },

    #[error("No executor registered for task {0}")]
    NoExecutor(String),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Invalid task id: {0}")]
    InvalidId(String),

    #[error("Task {0} already exists")]
    Duplicate(TaskId),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access to scope denied")]
    AccessDenied,

    #[error("Role too low for this operation")]
    InsufficientRole,
}

impl TaskError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedTask(_) => "unsupported-task",
            Self::MissingScope => "missing-scope",
            Self::InvalidOptions { .. } => "invalid-options",
            Self::NoExecutor(_) => "executor-unavailable",
            Self::NotFound(_) => "task-not-found",
            Self::InvalidId(_) => "invalid-task-id",
            Self::Duplicate(_) => "duplicate-task",
            Self::Unauthenticated => "unauthenticated",
            Self::AccessDenied => "guild-access-denied",
            Self::InsufficientRole => "insufficient-role",
        }
    }
}

/// Failures raised by an executor that prevent a clean exit code.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_http_contract() {
        assert_eq!(
            TaskError::UnsupportedTask("nope".into()).code(),
            "unsupported-task"
        );
        assert_eq!(TaskError::NotFound(TaskId::new()).code(), "task-not-found");
        assert_eq!(TaskError::AccessDenied.code(), "guild-access-denied");
    }

    #[test]
    fn executor_failure_message_is_verbatim() {
        let err = ExecutorError::Failed("connection refused".into());
        assert_eq!(err.to_string(), "connection refused");
    }
}
