//! # Worker Error Types
//!
//! Structured error handling for the task worker using thiserror. The
//! taxonomy separates logic errors (surfaced immediately as task FAILURE)
//! from transient infrastructure errors (retried locally with backoff).

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the worker engine and its collaborators.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Task name has no registered handler. Evidence of a registry/version
    /// mismatch between producer and consumer; dead-lettered, never retried.
    #[error("unknown task: {task_name}")]
    UnknownTask { task_name: String },

    /// A handler was registered twice under the same name.
    #[error("duplicate task registration: {task_name}")]
    DuplicateTask { task_name: String },

    /// Handler exceeded its allotted execution time. Retryable up to budget.
    #[error("handler for {task_name} timed out after {timeout_secs}s")]
    HandlerTimeout {
        task_name: String,
        timeout_secs: u64,
    },

    /// Handler raised during execution. Retryable unless the handler marked
    /// the failure fatal.
    #[error("handler for {task_name} failed: {message}")]
    HandlerFailed {
        task_name: String,
        message: String,
        retryable: bool,
    },

    /// Broker connection lost or operation failed. Reconnect with backoff,
    /// unbounded retry count; never surfaced as a task failure.
    #[error("broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    /// Submission to the external job backend failed before a handle was
    /// persisted. Safe to retry.
    #[error("external job submission failed for task {task_id}: {message}")]
    SubmissionFailed { task_id: Uuid, message: String },

    /// Submission succeeded but handle persistence failed. The job is running
    /// without a tracked handle; flagged for reconciliation, not silently lost.
    #[error("external job {external_job_id} orphaned for task {task_id}: {message}")]
    JobOrphaned {
        task_id: Uuid,
        external_job_id: String,
        message: String,
    },

    /// External job exceeded its maximum wall-clock deadline. Surfaced as
    /// FAILURE; the backend job is left to be cancelled or self-expire.
    #[error("external job {external_job_id} exceeded poll deadline of {deadline_secs}s")]
    PollDeadlineExceeded {
        external_job_id: String,
        deadline_secs: u64,
    },

    /// A TaskResult write would move the state machine backward.
    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("state store error: {message}")]
    StoreError { message: String },

    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl WorkerError {
    pub fn unknown_task(task_name: impl Into<String>) -> Self {
        Self::UnknownTask {
            task_name: task_name.into(),
        }
    }

    pub fn duplicate_task(task_name: impl Into<String>) -> Self {
        Self::DuplicateTask {
            task_name: task_name.into(),
        }
    }

    pub fn handler_timeout(task_name: impl Into<String>, timeout_secs: u64) -> Self {
        Self::HandlerTimeout {
            task_name: task_name.into(),
            timeout_secs,
        }
    }

    pub fn handler_failed(
        task_name: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::HandlerFailed {
            task_name: task_name.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Whether the dispatch layer may redeliver the task after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandlerTimeout { .. } => true,
            Self::HandlerFailed { retryable, .. } => *retryable,
            Self::SubmissionFailed { .. } => true,
            Self::BrokerUnavailable { .. } => true,
            Self::StoreError { .. } => true,
            Self::UnknownTask { .. }
            | Self::DuplicateTask { .. }
            | Self::JobOrphaned { .. }
            | Self::PollDeadlineExceeded { .. }
            | Self::InvalidTransition { .. }
            | Self::ConfigurationError { .. }
            | Self::Serialization { .. } => false,
        }
    }

    /// Short stable identifier for the error kind, recorded on TaskResult
    /// failures so callers can branch without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTask { .. } => "unknown_task",
            Self::DuplicateTask { .. } => "duplicate_task",
            Self::HandlerTimeout { .. } => "handler_timeout",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::SubmissionFailed { .. } => "submission_failed",
            Self::JobOrphaned { .. } => "job_orphaned",
            Self::PollDeadlineExceeded { .. } => "poll_deadline_exceeded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::StoreError { .. } => "store_error",
            Self::ConfigurationError { .. } => "configuration_error",
            Self::Serialization { .. } => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreError {
            message: err.to_string(),
        }
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_classification() {
        assert!(WorkerError::handler_timeout("demo", 30).is_retryable());
        assert!(WorkerError::handler_failed("demo", "flaky", true).is_retryable());
        assert!(!WorkerError::handler_failed("demo", "bad input", false).is_retryable());
        assert!(!WorkerError::unknown_task("ghost").is_retryable());
        assert!(!WorkerError::PollDeadlineExceeded {
            external_job_id: "job-1".into(),
            deadline_secs: 60,
        }
        .is_retryable());
    }

    #[test]
    fn kind_is_stable() {
        let err = WorkerError::unknown_task("ghost");
        assert_eq!(err.kind(), "unknown_task");
        assert!(err.to_string().contains("ghost"));
    }
}
