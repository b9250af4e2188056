//! # State Store
//!
//! Durable record of task and job status: the single source of truth for
//! TaskResult lineage tracking, schedule firing marks, and external job
//! handles. All cross-process coordination (dedup, HA scheduling, crash
//! recovery) goes through its compare-and-swap primitives; no in-memory
//! lock is trusted across process boundaries.

pub mod memory;
pub mod postgres;
pub mod records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::state::TaskState;

pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use records::{ExternalJobHandle, StateTransition, TaskFailure, TaskResult};

/// Durable store contract.
///
/// Writes to TaskResult go through `compare_and_swap_result`, which enforces
/// the monotonic state machine: the swap applies only when the stored state
/// equals `expected` and the machine allows the edge. Writes against
/// terminal records always return false, which is what makes redelivery
/// after SUCCESS a no-op.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>>;

    /// Fetch the record for a task_id, creating a PENDING one on first
    /// observation.
    async fn ensure_result(&self, task_id: Uuid, task_name: &str) -> Result<TaskResult>;

    /// Conditionally replace the record: applies iff the stored state equals
    /// `expected` and `expected -> next.state` is an allowed transition.
    /// Returns whether the swap applied.
    async fn compare_and_swap_result(
        &self,
        task_id: Uuid,
        expected: TaskState,
        next: &TaskResult,
    ) -> Result<bool>;

    /// All results currently in one of the given states.
    async fn scan_results(&self, states: &[TaskState]) -> Result<Vec<TaskResult>>;

    /// Last successful firing time for a beat entry, if any.
    async fn schedule_last_fired(&self, name: &str) -> Result<Option<DateTime<Utc>>>;

    /// Atomically advance a beat entry's firing mark. Applies iff the stored
    /// mark still equals `expected`; exactly one racing scheduler replica
    /// wins each window.
    async fn compare_and_swap_schedule(
        &self,
        name: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_handle(&self, task_id: Uuid) -> Result<Option<ExternalJobHandle>>;

    /// Upsert an external job handle.
    async fn put_handle(&self, handle: &ExternalJobHandle) -> Result<()>;

    /// Atomically update a handle's poll bookkeeping. Applies iff the stored
    /// `last_polled_at` still equals `expected`; used by reconciler replicas
    /// to claim a handle for one polling sweep.
    async fn compare_and_swap_handle(
        &self,
        task_id: Uuid,
        expected_last_polled: Option<DateTime<Utc>>,
        next: &ExternalJobHandle,
    ) -> Result<bool>;

    async fn delete_handle(&self, task_id: Uuid) -> Result<()>;

    /// Handles whose TaskResult has not reached a terminal state; the
    /// reconciliation scan after a restart.
    async fn scan_open_handles(&self) -> Result<Vec<ExternalJobHandle>>;

    /// Drop handles whose TaskResult is terminal (retention housekeeping).
    /// Returns how many were removed.
    async fn purge_closed_handles(&self) -> Result<usize>;

    /// Mark a task REVOKED so later deliveries short-circuit. Returns false
    /// when the task is already terminal. Preemption of a running handler is
    /// not guaranteed; revocation is cooperative.
    async fn revoke_result(&self, task_id: Uuid) -> Result<bool> {
        loop {
            let Some(current) = self.get_result(task_id).await? else {
                return Ok(false);
            };
            if current.state.is_terminal() {
                return Ok(false);
            }
            let revoked = current.transitioned(TaskState::Revoked)?;
            if self
                .compare_and_swap_result(task_id, current.state, &revoked)
                .await?
            {
                return Ok(true);
            }
            // Lost a race with a concurrent transition; re-read and retry.
        }
    }
}
