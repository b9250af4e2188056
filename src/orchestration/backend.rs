//! # Pipeline Backend Interface
//!
//! The external long-running execution backend (a cloud genomics workflow
//! engine in the original deployment) is a consumed interface: the engine
//! submits a job spec, polls status, and fetches outputs. Nothing here
//! models the backend's wire format beyond that contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::BackendJobState;

/// Opaque description of one pipeline run: the workflow to execute and its
/// inputs mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Workflow identifier or source location
    pub workflow: String,
    /// Inputs mapping, passed through to the backend verbatim
    pub inputs: Value,
}

impl JobSpec {
    pub fn new(workflow: impl Into<String>, inputs: Value) -> Self {
        Self {
            workflow: workflow.into(),
            inputs,
        }
    }
}

/// Errors from the backend client.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend unreachable or returned a transient error
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the job spec
    #[error("backend rejected submission: {0}")]
    Rejected(String),

    /// Backend has no record of the job id
    #[error("backend has no job {0}")]
    NotFound(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Submit/poll/outputs contract for the external execution backend.
#[async_trait]
pub trait PipelineBackend: Send + Sync + 'static {
    /// Submit a job; returns the backend-assigned job id. Submission is the
    /// point of no return: the caller must persist a handle immediately.
    async fn submit(&self, spec: &JobSpec) -> BackendResult<String>;

    /// Current state of a job, normalized to the engine's vocabulary.
    async fn status(&self, job_id: &str) -> BackendResult<BackendJobState>;

    /// Result payload for a succeeded job, or failure detail for a failed
    /// one.
    async fn outputs(&self, job_id: &str) -> BackendResult<Value>;
}
