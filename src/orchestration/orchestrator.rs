//! # Job Orchestrator
//!
//! Bridges a task invocation to an externally executing, long-running job:
//! submit, persist a durable handle, then poll on a growing interval until
//! the backend reports a terminal state or the wall-clock deadline passes.
//! Backend calls go through a circuit breaker so a misbehaving backend
//! fails fast instead of piling up poll traffic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, PollInterval};
use crate::state::{BackendJobState, TaskState};
use crate::store::{ExternalJobHandle, StateStore, TaskFailure};

use super::backend::{JobSpec, PipelineBackend};

/// Poll pacing and deadline for external jobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// First poll interval; doubles per poll
    pub poll_interval_base: Duration,
    /// Ceiling on the poll interval
    pub poll_interval_max: Duration,
    /// Wall-clock budget from submission to terminal state
    pub max_wall_clock: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_base: Duration::from_secs(5),
            poll_interval_max: Duration::from_secs(600),
            max_wall_clock: Duration::from_secs(24 * 3600),
        }
    }
}

/// Terminal outcome of one watched job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Backend succeeded; payload is the fetched outputs
    Succeeded(Value),
    /// Backend failed; payload is the failure detail
    Failed(Value),
    /// The task was revoked while the job was in flight; the backend job is
    /// left to be cancelled separately or to self-expire
    Revoked,
}

/// Orchestrates submit-and-poll against the pipeline backend.
pub struct JobOrchestrator {
    backend: Arc<dyn PipelineBackend>,
    store: Arc<dyn StateStore>,
    breaker: CircuitBreaker,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        store: Arc<dyn StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            breaker: CircuitBreaker::new("pipeline_backend", CircuitBreakerConfig::default()),
            config,
        }
    }

    /// Submit a job for `task_id` and persist its handle.
    ///
    /// Idempotent per lineage: when a handle already exists for the task_id
    /// (a retry after a crash mid-run), the existing job is reused instead
    /// of submitting a duplicate.
    pub async fn submit(&self, task_id: Uuid, spec: &JobSpec) -> Result<ExternalJobHandle> {
        if let Some(existing) = self.store.get_handle(task_id).await? {
            info!(
                %task_id,
                external_job_id = %existing.external_job_id,
                "Reusing existing job handle, skipping resubmission"
            );
            return Ok(existing);
        }

        let external_job_id = self
            .breaker
            .call(|| self.backend.submit(spec))
            .await
            .map_err(|err| WorkerError::SubmissionFailed {
                task_id,
                message: err.to_string(),
            })?;

        let handle = ExternalJobHandle::new(task_id, &external_job_id);
        if let Err(err) = self.store.put_handle(&handle).await {
            // The job is running without a tracked handle. Degraded
            // condition: surfaced loudly for reconciliation against the
            // backend's job listing, never silently dropped.
            error!(
                %task_id,
                external_job_id = %external_job_id,
                error = %err,
                "Handle persistence failed after successful submission, job is orphaned"
            );
            return Err(WorkerError::JobOrphaned {
                task_id,
                external_job_id,
                message: err.to_string(),
            });
        }

        info!(
            %task_id,
            external_job_id = %handle.external_job_id,
            workflow = %spec.workflow,
            "External job submitted"
        );
        Ok(handle)
    }

    /// Poll a handle until the backend reports a terminal state, the task is
    /// revoked, or the wall-clock deadline passes. Does not touch the
    /// TaskResult; callers translate the outcome.
    pub async fn watch(&self, handle: &ExternalJobHandle) -> Result<JobOutcome> {
        let deadline = handle.submitted_at
            + chrono::Duration::from_std(self.config.max_wall_clock)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut interval = PollInterval::new(
            self.config.poll_interval_base,
            self.config.poll_interval_max,
        );
        let mut current = handle.clone();

        loop {
            if let Some(result) = self.store.get_result(current.task_id).await? {
                if result.state == TaskState::Revoked {
                    info!(
                        task_id = %current.task_id,
                        external_job_id = %current.external_job_id,
                        "Task revoked mid-poll, abandoning watch"
                    );
                    return Ok(JobOutcome::Revoked);
                }
            }

            let state = match self
                .breaker
                .call(|| self.backend.status(&current.external_job_id))
                .await
            {
                Ok(state) => state,
                Err(err) => {
                    // Transient backend trouble is not a job failure; record
                    // UNKNOWN and keep polling until the deadline.
                    warn!(
                        external_job_id = %current.external_job_id,
                        error = %err,
                        "Status poll failed"
                    );
                    BackendJobState::Unknown
                }
            };

            current = current.polled(state);
            self.store.put_handle(&current).await?;
            debug!(
                external_job_id = %current.external_job_id,
                backend_state = %state,
                "Polled external job"
            );

            match state {
                BackendJobState::Succeeded => {
                    let outputs = self
                        .breaker
                        .call(|| self.backend.outputs(&current.external_job_id))
                        .await
                        .map_err(|err| WorkerError::SubmissionFailed {
                            task_id: current.task_id,
                            message: format!("outputs fetch failed: {err}"),
                        })?;
                    return Ok(JobOutcome::Succeeded(outputs));
                }
                BackendJobState::Failed => {
                    let detail = self
                        .breaker
                        .call(|| self.backend.outputs(&current.external_job_id))
                        .await
                        .unwrap_or_else(|err| {
                            serde_json::json!({ "error": format!("failure detail unavailable: {err}") })
                        });
                    return Ok(JobOutcome::Failed(detail));
                }
                BackendJobState::Running | BackendJobState::Unknown => {}
            }

            if Utc::now() >= deadline {
                return Err(WorkerError::PollDeadlineExceeded {
                    external_job_id: current.external_job_id.clone(),
                    deadline_secs: self.config.max_wall_clock.as_secs(),
                });
            }

            tokio::time::sleep(interval.next_delay()).await;
        }
    }

    /// Submit and poll synchronously inside the calling slot. For short
    /// jobs; long ones should use `submit` + `HandlerOutcome::Detached` and
    /// let the reconciler poll.
    pub async fn run_to_completion(&self, task_id: Uuid, spec: &JobSpec) -> Result<JobOutcome> {
        let handle = self.submit(task_id, spec).await?;
        self.watch(&handle).await
    }

    /// Drive a detached handle to completion and record the terminal
    /// TaskResult. Used by the reconciler for resumed handles.
    pub async fn finalize(&self, handle: ExternalJobHandle) -> Result<()> {
        let task_id = handle.task_id;
        let outcome = self.watch(&handle).await;

        let current = self.store.get_result(task_id).await?;
        match (outcome, current) {
            (Ok(JobOutcome::Succeeded(outputs)), Some(result))
                if result.state == TaskState::Started =>
            {
                let done = result.succeeded(outputs)?;
                self.store
                    .compare_and_swap_result(task_id, TaskState::Started, &done)
                    .await?;
                info!(%task_id, "External job completed, task succeeded");
            }
            (Ok(JobOutcome::Failed(detail)), Some(result))
                if result.state == TaskState::Started =>
            {
                let failed = result.failed(TaskFailure {
                    kind: "job_failed".to_string(),
                    message: detail.to_string(),
                    retryable: false,
                })?;
                self.store
                    .compare_and_swap_result(task_id, TaskState::Started, &failed)
                    .await?;
                warn!(%task_id, "External job failed, task failed");
            }
            (Ok(JobOutcome::Revoked), _) => {}
            (Err(err @ WorkerError::PollDeadlineExceeded { .. }), Some(result))
                if result.state == TaskState::Started =>
            {
                let failed = result.failed(TaskFailure::from(&err))?;
                self.store
                    .compare_and_swap_result(task_id, TaskState::Started, &failed)
                    .await?;
                warn!(%task_id, error = %err, "External job deadline exceeded");
            }
            (Err(err), _) => {
                // Store or backend trouble: keep the handle so the next
                // reconciliation sweep retries from where we left off.
                warn!(%task_id, error = %err, "Finalize interrupted, handle retained");
                return Err(err);
            }
            (Ok(_), other) => {
                debug!(%task_id, state = ?other.map(|r| r.state), "Result no longer finalizable");
            }
        }

        self.store.delete_handle(task_id).await?;
        Ok(())
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }
}
