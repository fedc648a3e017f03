//! Error types for scheduling, compilation, and sessions.

use thiserror::Error;

use crate::task::TaskStatus;
use crate::types::{TaskId, TaskName};

/// Errors raised while compiling one sweep step into hardware commands.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The resolved device configuration lacks a required entry.
    #[error("missing configuration entry `{key}`")]
    MissingConfig { key: String },

    /// A configuration entry exists but cannot be used.
    #[error("invalid configuration entry `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// A child task submitted from within a compile routine did not run.
    #[error("child task failed: {0}")]
    Child(String),

    #[error("{0}")]
    Other(String),
}

impl CompileError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingConfig { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the scheduler and its sessions.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task has left `not submitted` already.
    #[error("task {name} ({id}) has already been submitted (status: {status})")]
    AlreadySubmitted {
        name: TaskName,
        id: String,
        status: TaskStatus,
    },

    /// The operation needs an id the task has not been assigned yet.
    #[error("task {0} has not been submitted")]
    NotSubmitted(TaskName),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("invalid credentials for user `{0}`")]
    InvalidCredentials(String),

    #[error("user `{0}` not found")]
    UserNotFound(String),

    #[error("user `{0}` already exists")]
    UserExists(String),

    /// Maintenance ran out of its retry budget without an accepted result.
    #[error("calibration of {task} exhausted after {attempts} attempts (last score: {last_score})")]
    CalibrationExhausted {
        task: TaskName,
        attempts: u32,
        last_score: i32,
    },

    /// Unexpected failure inside a background activity.
    #[error("task {task} ({id}) failed: {message}")]
    ExecutionFailure {
        task: TaskName,
        id: TaskId,
        message: String,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<surrealdb::Error> for SchedulerError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::missing("Q1.channel.I");
        assert_eq!(err.to_string(), "missing configuration entry `Q1.channel.I`");

        let err = CompileError::invalid("Q1.setting.LO", "expected a number");
        assert_eq!(
            err.to_string(),
            "invalid configuration entry `Q1.setting.LO`: expected a number"
        );
    }

    #[test]
    fn test_compile_error_converts() {
        let err: SchedulerError = CompileError::missing("x").into();
        assert!(matches!(err, SchedulerError::Compile(CompileError::MissingConfig { .. })));
    }

    #[test]
    fn test_calibration_exhausted_display() {
        let err = SchedulerError::CalibrationExhausted {
            task: TaskName::new("rabi"),
            attempts: 3,
            last_score: 0,
        };
        assert_eq!(
            err.to_string(),
            "calibration of rabi exhausted after 3 attempts (last score: 0)"
        );
    }
}
