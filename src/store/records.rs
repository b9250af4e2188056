//! # Persisted Records
//!
//! The three record families owned by the state store: task results,
//! schedule firing marks, and external job handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::state::{BackendJobState, TaskState};

/// One recorded state transition with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// Structured failure description recorded on FAILURE results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stable error kind ("unknown_task", "handler_timeout", ...)
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&WorkerError> for TaskFailure {
    fn from(err: &WorkerError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Mutable result record keyed by task_id.
///
/// Created on first observation of a task_id, updated by whichever worker
/// slot processes a delivery, never deleted by the worker. All writes go
/// through the state store's compare-and-swap so transitions stay monotonic
/// across processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub task_name: String,
    pub state: TaskState,
    /// Present iff state == Success
    pub result: Option<Value>,
    /// Present iff state == Failure
    pub error: Option<TaskFailure>,
    /// Retries attempted so far in this lineage
    pub retry_count: u32,
    /// Timestamps for each state transition, oldest first
    pub transitions: Vec<StateTransition>,
}

impl TaskResult {
    /// Fresh PENDING record for a newly observed task_id.
    pub fn pending(task_id: Uuid, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            state: TaskState::Pending,
            result: None,
            error: None,
            retry_count: 0,
            transitions: vec![StateTransition {
                state: TaskState::Pending,
                at: Utc::now(),
            }],
        }
    }

    /// Copy of this record moved to `next`, with the transition recorded.
    /// Fails if the state machine forbids the edge.
    pub fn transitioned(&self, next: TaskState) -> crate::error::Result<Self> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                task_id: self.task_id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let mut updated = self.clone();
        updated.state = next;
        updated.transitions.push(StateTransition {
            state: next,
            at: Utc::now(),
        });
        Ok(updated)
    }

    /// Terminal SUCCESS with the handler's return value.
    pub fn succeeded(&self, value: Value) -> crate::error::Result<Self> {
        let mut updated = self.transitioned(TaskState::Success)?;
        updated.result = Some(value);
        updated.error = None;
        Ok(updated)
    }

    /// Terminal FAILURE with a structured error.
    pub fn failed(&self, failure: TaskFailure) -> crate::error::Result<Self> {
        let mut updated = self.transitioned(TaskState::Failure)?;
        updated.error = Some(failure);
        updated.result = None;
        Ok(updated)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Durable handle for an externally executing job.
///
/// Exactly one handle exists per task_id that submitted an external job; it
/// persists until the corresponding TaskResult reaches a terminal state so
/// polling can resume after a worker crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalJobHandle {
    pub task_id: Uuid,
    pub external_job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub backend_state: BackendJobState,
}

impl ExternalJobHandle {
    pub fn new(task_id: Uuid, external_job_id: impl Into<String>) -> Self {
        Self {
            task_id,
            external_job_id: external_job_id.into(),
            submitted_at: Utc::now(),
            last_polled_at: None,
            backend_state: BackendJobState::Running,
        }
    }

    pub fn polled(&self, state: BackendJobState) -> Self {
        let mut updated = self.clone();
        updated.last_polled_at = Some(Utc::now());
        updated.backend_state = state;
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_record_has_initial_transition() {
        let result = TaskResult::pending(Uuid::new_v4(), "run_pipeline");
        assert_eq!(result.state, TaskState::Pending);
        assert_eq!(result.transitions.len(), 1);
        assert_eq!(result.transitions[0].state, TaskState::Pending);
    }

    #[test]
    fn success_path_records_timestamps() {
        let pending = TaskResult::pending(Uuid::new_v4(), "run_pipeline");
        let started = pending.transitioned(TaskState::Started).unwrap();
        let done = started.succeeded(serde_json::json!({"output": "gs://bucket/out"})).unwrap();

        assert!(done.is_terminal());
        assert!(done.result.is_some());
        assert!(done.error.is_none());
        let states: Vec<TaskState> = done.transitions.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Pending, TaskState::Started, TaskState::Success]
        );
    }

    #[test]
    fn terminal_record_rejects_further_transitions() {
        let pending = TaskResult::pending(Uuid::new_v4(), "run_pipeline");
        let started = pending.transitioned(TaskState::Started).unwrap();
        let done = started.succeeded(serde_json::json!(null)).unwrap();

        let err = done.transitioned(TaskState::Started).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn failure_carries_structured_error() {
        let failure = TaskFailure::from(&WorkerError::unknown_task("ghost"));
        assert_eq!(failure.kind, "unknown_task");
        assert!(!failure.retryable);
    }
}
