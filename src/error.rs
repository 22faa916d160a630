//! Error types for the analysis pipeline.
//!
//! Configuration and request errors are fatal and surface before any agent
//! is called. Invocation errors are absorbed by the orchestrator and turned
//! into the run's returned content.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the pipeline and its building blocks.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid role instructions, credentials or limits.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The caller-supplied request is missing required fields or is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An agent call raised, produced unusable output or missed its deadline.
    #[error("Agent '{role}' failed: {message}")]
    Invocation { role: String, message: String },
}

impl PipelineError {
    pub fn invocation(role: impl Into<String>, message: impl ToString) -> Self {
        PipelineError::Invocation {
            role: role.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error aborts before any stage is dispatched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Invocation { .. })
    }
}

/// Failures of the blocking worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("call exceeded its {}s deadline", .0.as_secs_f64())]
    DeadlineExceeded(Duration),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_message_names_role() {
        let err = PipelineError::invocation("gap-assessment", "connection refused");
        assert_eq!(
            err.to_string(),
            "Agent 'gap-assessment' failed: connection refused"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_configuration_is_fatal() {
        assert!(PipelineError::Configuration("no api key".into()).is_fatal());
        assert!(PipelineError::InvalidRequest("missing name".into()).is_fatal());
    }

    #[test]
    fn test_deadline_display() {
        let err = WorkerError::DeadlineExceeded(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "call exceeded its 1.5s deadline");
    }
}
