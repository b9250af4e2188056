//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use taskmanager_core::orchestration::{BackendError, BackendResult, JobSpec, PipelineBackend};
use taskmanager_core::state::{BackendJobState, TaskState};
use taskmanager_core::store::StateStore;

/// Scripted pipeline backend: plays back a fixed sequence of states and
/// records submit/poll activity for assertions.
pub struct MockPipelineBackend {
    states: Mutex<Vec<BackendJobState>>,
    outputs: Value,
    pub submit_count: AtomicUsize,
    pub poll_times: Mutex<Vec<Instant>>,
}

impl MockPipelineBackend {
    pub fn new(states: Vec<BackendJobState>, outputs: Value) -> Self {
        Self {
            states: Mutex::new(states),
            outputs,
            submit_count: AtomicUsize::new(0),
            poll_times: Mutex::new(Vec::new()),
        }
    }

    pub fn submits(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub async fn poll_gaps(&self) -> Vec<Duration> {
        let times = self.poll_times.lock().await;
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl PipelineBackend for MockPipelineBackend {
    async fn submit(&self, spec: &JobSpec) -> BackendResult<String> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{}", spec.workflow))
    }

    async fn status(&self, _job_id: &str) -> BackendResult<BackendJobState> {
        self.poll_times.lock().await.push(Instant::now());
        let mut states = self.states.lock().await;
        if states.len() > 1 {
            Ok(states.remove(0))
        } else {
            states
                .first()
                .copied()
                .ok_or_else(|| BackendError::Unavailable("no scripted state".into()))
        }
    }

    async fn outputs(&self, job_id: &str) -> BackendResult<Value> {
        let mut outputs = self.outputs.clone();
        if let Value::Object(map) = &mut outputs {
            map.insert("job_id".into(), Value::String(job_id.to_string()));
        }
        Ok(outputs)
    }
}

/// Poll the store until the lineage reaches `expected` or the timeout runs
/// out; returns the final record.
pub async fn wait_for_state(
    store: &Arc<dyn StateStore>,
    task_id: Uuid,
    expected: TaskState,
    timeout: Duration,
) -> taskmanager_core::store::TaskResult {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = store.get_result(task_id).await.unwrap() {
            if result.state == expected {
                return result;
            }
        }
        assert!(
            Instant::now() < deadline,
            "task {task_id} did not reach {expected} within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
