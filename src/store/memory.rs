//! # In-Memory State Store
//!
//! Dashmap-backed store for tests and single-process deployments. The
//! compare-and-swap operations rely on dashmap's entry locking, so they are
//! atomic with respect to concurrent writers in the same process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::state::TaskState;

use super::records::{ExternalJobHandle, TaskResult};
use super::StateStore;

/// In-process state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    results: DashMap<Uuid, TaskResult>,
    schedule_marks: DashMap<String, DateTime<Utc>>,
    handles: DashMap<Uuid, ExternalJobHandle>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        Ok(self.results.get(&task_id).map(|r| r.clone()))
    }

    async fn ensure_result(&self, task_id: Uuid, task_name: &str) -> Result<TaskResult> {
        let record = self
            .results
            .entry(task_id)
            .or_insert_with(|| TaskResult::pending(task_id, task_name))
            .clone();
        Ok(record)
    }

    async fn compare_and_swap_result(
        &self,
        task_id: Uuid,
        expected: TaskState,
        next: &TaskResult,
    ) -> Result<bool> {
        match self.results.entry(task_id) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.state == expected && current.state.can_transition_to(next.state) {
                    occupied.insert(next.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn scan_results(&self, states: &[TaskState]) -> Result<Vec<TaskResult>> {
        Ok(self
            .results
            .iter()
            .filter(|entry| states.contains(&entry.state))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn schedule_last_fired(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.schedule_marks.get(name).map(|mark| *mark))
    }

    async fn compare_and_swap_schedule(
        &self,
        name: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.schedule_marks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(*occupied.get()) {
                    occupied.insert(fired_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(fired_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn get_handle(&self, task_id: Uuid) -> Result<Option<ExternalJobHandle>> {
        Ok(self.handles.get(&task_id).map(|h| h.clone()))
    }

    async fn put_handle(&self, handle: &ExternalJobHandle) -> Result<()> {
        self.handles.insert(handle.task_id, handle.clone());
        Ok(())
    }

    async fn compare_and_swap_handle(
        &self,
        task_id: Uuid,
        expected_last_polled: Option<DateTime<Utc>>,
        next: &ExternalJobHandle,
    ) -> Result<bool> {
        match self.handles.entry(task_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().last_polled_at == expected_last_polled {
                    occupied.insert(next.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn delete_handle(&self, task_id: Uuid) -> Result<()> {
        self.handles.remove(&task_id);
        Ok(())
    }

    async fn scan_open_handles(&self) -> Result<Vec<ExternalJobHandle>> {
        let open = self
            .handles
            .iter()
            .filter(|handle| {
                self.results
                    .get(&handle.task_id)
                    .map(|result| !result.state.is_terminal())
                    .unwrap_or(true)
            })
            .map(|handle| handle.clone())
            .collect();
        Ok(open)
    }

    async fn purge_closed_handles(&self) -> Result<usize> {
        let closed: Vec<Uuid> = self
            .handles
            .iter()
            .filter(|handle| {
                self.results
                    .get(&handle.task_id)
                    .map(|result| result.state.is_terminal())
                    .unwrap_or(false)
            })
            .map(|handle| handle.task_id)
            .collect();
        for task_id in &closed {
            self.handles.remove(task_id);
        }
        Ok(closed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BackendJobState;

    #[tokio::test]
    async fn ensure_result_creates_pending_once() {
        let store = InMemoryStateStore::new();
        let task_id = Uuid::new_v4();

        let first = store.ensure_result(task_id, "run_pipeline").await.unwrap();
        assert_eq!(first.state, TaskState::Pending);

        // Second observation returns the same record, not a reset one.
        let started = first.transitioned(TaskState::Started).unwrap();
        assert!(store
            .compare_and_swap_result(task_id, TaskState::Pending, &started)
            .await
            .unwrap());

        let second = store.ensure_result(task_id, "run_pipeline").await.unwrap();
        assert_eq!(second.state, TaskState::Started);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_state() {
        let store = InMemoryStateStore::new();
        let task_id = Uuid::new_v4();
        let pending = store.ensure_result(task_id, "run_pipeline").await.unwrap();
        let started = pending.transitioned(TaskState::Started).unwrap();

        assert!(store
            .compare_and_swap_result(task_id, TaskState::Pending, &started)
            .await
            .unwrap());
        // Same swap again: the expected state no longer matches.
        assert!(!store
            .compare_and_swap_result(task_id, TaskState::Pending, &started)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn terminal_results_are_write_protected() {
        let store = InMemoryStateStore::new();
        let task_id = Uuid::new_v4();
        let pending = store.ensure_result(task_id, "run_pipeline").await.unwrap();
        let started = pending.transitioned(TaskState::Started).unwrap();
        store
            .compare_and_swap_result(task_id, TaskState::Pending, &started)
            .await
            .unwrap();
        let done = started.succeeded(serde_json::json!("out")).unwrap();
        store
            .compare_and_swap_result(task_id, TaskState::Started, &done)
            .await
            .unwrap();

        // A stale worker trying to fail the task after success is a no-op.
        let stale_failure = started
            .failed(super::super::records::TaskFailure {
                kind: "handler_failed".into(),
                message: "late".into(),
                retryable: false,
            })
            .unwrap();
        assert!(!store
            .compare_and_swap_result(task_id, TaskState::Success, &stale_failure)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap_result(task_id, TaskState::Started, &stale_failure)
            .await
            .unwrap());

        let current = store.get_result(task_id).await.unwrap().unwrap();
        assert_eq!(current.state, TaskState::Success);
    }

    #[tokio::test]
    async fn scan_results_filters_by_state() {
        let store = InMemoryStateStore::new();
        let running_id = Uuid::new_v4();
        let pending = store.ensure_result(running_id, "run_pipeline").await.unwrap();
        let started = pending.transitioned(TaskState::Started).unwrap();
        store
            .compare_and_swap_result(running_id, TaskState::Pending, &started)
            .await
            .unwrap();
        store
            .ensure_result(Uuid::new_v4(), "nightly_report")
            .await
            .unwrap();

        let active = store.scan_results(&[TaskState::Started]).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, running_id);

        let open = store
            .scan_results(&[TaskState::Pending, TaskState::Started])
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn schedule_cas_allows_single_winner() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();

        assert!(store
            .compare_and_swap_schedule("nightly_report", None, now)
            .await
            .unwrap());
        // Loser raced with the same expectation.
        assert!(!store
            .compare_and_swap_schedule("nightly_report", None, now)
            .await
            .unwrap());
        // Winner of the next window must present the stored mark.
        let later = now + chrono::Duration::hours(24);
        assert!(store
            .compare_and_swap_schedule("nightly_report", Some(now), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn open_handle_scan_skips_terminal_results() {
        let store = InMemoryStateStore::new();

        let open_id = Uuid::new_v4();
        store.ensure_result(open_id, "run_pipeline").await.unwrap();
        store
            .put_handle(&ExternalJobHandle::new(open_id, "job-open"))
            .await
            .unwrap();

        let done_id = Uuid::new_v4();
        let pending = store.ensure_result(done_id, "run_pipeline").await.unwrap();
        let started = pending.transitioned(TaskState::Started).unwrap();
        store
            .compare_and_swap_result(done_id, TaskState::Pending, &started)
            .await
            .unwrap();
        let done = started.succeeded(serde_json::json!(null)).unwrap();
        store
            .compare_and_swap_result(done_id, TaskState::Started, &done)
            .await
            .unwrap();
        store
            .put_handle(&ExternalJobHandle::new(done_id, "job-done"))
            .await
            .unwrap();

        let open = store.scan_open_handles().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].external_job_id, "job-open");
    }

    #[tokio::test]
    async fn handle_cas_guards_poll_claims() {
        let store = InMemoryStateStore::new();
        let task_id = Uuid::new_v4();
        let handle = ExternalJobHandle::new(task_id, "job-1");
        store.put_handle(&handle).await.unwrap();

        let claimed = handle.polled(BackendJobState::Running);
        assert!(store
            .compare_and_swap_handle(task_id, None, &claimed)
            .await
            .unwrap());
        // A second replica presenting the stale mark loses.
        assert!(!store
            .compare_and_swap_handle(task_id, None, &claimed)
            .await
            .unwrap());
    }
}
