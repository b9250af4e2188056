//! # Worker Pool
//!
//! Bounds concurrent task execution to a configured slot count. Each slot
//! runs an independent loop: pull the next visible delivery, dispatch it,
//! and acknowledge per the dispatch outcome. Slots communicate with the
//! scheduler and other processes only through the broker and the state
//! store; there is no shared in-memory coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};
use crate::worker::dispatch::Dispatcher;

/// Pool sizing and polling parameters.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent execution slots
    pub concurrency: usize,
    /// Queues each slot drains, in priority order
    pub queues: Vec<String>,
    /// Visibility window requested on receive; the heartbeat extends it for
    /// slow handlers
    pub visibility_timeout: Duration,
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues: vec!["default".to_string()],
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Bounded pool of worker slots.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    config: WorkerPoolConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WorkerPoolConfig) -> Self {
        Self {
            dispatcher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the slot loops. Returns the JoinSet owning them; callers await
    /// it (or drop it on shutdown).
    pub fn spawn(&self) -> Result<JoinSet<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::configuration("worker pool already running"));
        }

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Worker pool starting"
        );

        let mut slots = JoinSet::new();
        for slot_id in 0..self.config.concurrency {
            let dispatcher = self.dispatcher.clone();
            let config = self.config.clone();
            let running = self.running.clone();
            let shutdown = self.shutdown.clone();
            slots.spawn(async move {
                slot_loop(slot_id, dispatcher, config, running, shutdown).await;
            });
        }
        Ok(slots)
    }

    /// Signal every slot to stop after its in-flight delivery.
    pub fn shutdown(&self) {
        info!("Worker pool stopping");
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

async fn slot_loop(
    slot_id: usize,
    dispatcher: Arc<Dispatcher>,
    config: WorkerPoolConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    debug!(slot_id, "Worker slot started");

    while running.load(Ordering::Acquire) {
        let mut dispatched = false;

        for queue_name in &config.queues {
            match dispatcher
                .broker()
                .receive(queue_name, 1, config.visibility_timeout)
                .await
            {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        dispatched = true;
                        let task_id = delivery.message.task_id;
                        match dispatcher.process(queue_name, delivery).await {
                            Ok(outcome) => {
                                debug!(slot_id, %task_id, ?outcome, "Delivery handled");
                            }
                            Err(err) => {
                                error!(slot_id, %task_id, error = %err, "Dispatch error");
                            }
                        }
                    }
                }
                Err(err) => {
                    // Broker trouble is never fatal to the slot; back off and
                    // let the client reconnect underneath us.
                    warn!(slot_id, queue = %queue_name, error = %err, "Receive failed");
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                        () = shutdown.notified() => return,
                    }
                }
            }

            if !running.load(Ordering::Acquire) {
                break;
            }
        }

        if !dispatched {
            tokio::select! {
                () = tokio::time::sleep(config.poll_interval) => {}
                () = shutdown.notified() => break,
            }
        }
    }

    debug!(slot_id, "Worker slot stopped");
}
