//! # Job Reconciler
//!
//! Periodic sweep that resumes polling of external jobs whose handles are
//! persisted but whose TaskResult has not reached a terminal state. This is
//! what keeps multi-hour jobs from consuming worker slots, and what picks
//! in-flight jobs back up after a process restart instead of losing track
//! of them. Replicas coordinate through a CAS claim on each handle's
//! `last_polled_at`, so a handle is driven by at most one sweep at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::store::StateStore;

use super::orchestrator::JobOrchestrator;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between sweeps of the handle table
    pub sweep_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Reconciliation loop over persisted external job handles.
pub struct Reconciler {
    orchestrator: Arc<JobOrchestrator>,
    store: Arc<dyn StateStore>,
    config: ReconcilerConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    /// Handles this process is already driving; avoids double-spawning
    /// between sweeps.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<JobOrchestrator>,
        store: Arc<dyn StateStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// One sweep: purge handles for finished tasks, then claim and resume
    /// every open handle not already being driven. Returns how many watch
    /// tasks this sweep spawned.
    pub async fn run_once(&self) -> Result<usize> {
        let purged = self.store.purge_closed_handles().await?;
        if purged > 0 {
            debug!(purged, "Dropped handles for finished tasks");
        }

        let mut resumed = 0;
        for handle in self.store.scan_open_handles().await? {
            let task_id = handle.task_id;

            {
                let in_flight = self.in_flight.lock().await;
                if in_flight.contains(&task_id) {
                    continue;
                }
            }

            // Claim the handle for this sweep; a losing replica skips it.
            let known_state = handle.backend_state;
            let claimed = handle.polled(known_state);
            if !self
                .store
                .compare_and_swap_handle(task_id, handle.last_polled_at, &claimed)
                .await?
            {
                debug!(%task_id, "Handle claimed by another reconciler");
                continue;
            }

            info!(
                %task_id,
                external_job_id = %claimed.external_job_id,
                backend_state = %known_state,
                "Resuming external job watch"
            );
            self.in_flight.lock().await.insert(task_id);
            resumed += 1;

            let orchestrator = self.orchestrator.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.finalize(claimed).await {
                    warn!(%task_id, error = %err, "Job finalize failed, will retry next sweep");
                }
                in_flight.lock().await.remove(&task_id);
            });
        }

        Ok(resumed)
    }

    /// Spawn the sweep loop. The first sweep runs immediately, which is the
    /// restart-recovery path.
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::configuration("reconciler already running"));
        }

        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            "Job reconciler starting"
        );

        let reconciler = self.clone();
        Ok(tokio::spawn(async move {
            while reconciler.running.load(Ordering::Acquire) {
                match reconciler.run_once().await {
                    Ok(resumed) if resumed > 0 => {
                        debug!(resumed, "Reconciliation sweep resumed jobs");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Reconciliation sweep failed"),
                }
                tokio::select! {
                    () = tokio::time::sleep(reconciler.config.sweep_interval) => {}
                    () = reconciler.shutdown.notified() => break,
                }
            }
            info!("Job reconciler stopped");
        }))
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}
