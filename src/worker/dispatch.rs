//! # Message Dispatch
//!
//! Per-delivery processing: revocation and expiry short-circuits, terminal
//! dedup, handler resolution, timeout enforcement with a visibility
//! heartbeat, and the retry/dead-letter decision. The delivery is never
//! acknowledged before its outcome is durably recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};
use crate::messaging::{Broker, QueuedMessage, TaskMessage};
use crate::registry::{HandlerOutcome, TaskContext, TaskRegistry};
use crate::state::TaskState;
use crate::store::{StateStore, TaskFailure, TaskResult};

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran to completion; SUCCESS recorded and delivery acked
    Completed,
    /// Retryable failure; successor published with backoff and delivery acked
    Retried,
    /// Non-retryable failure or exhausted budget; FAILURE recorded and
    /// delivery dead-lettered
    DeadLettered,
    /// Delivery short-circuited without handler invocation (revoked,
    /// expired, or already terminal)
    Skipped,
    /// Delivery left in flight; the broker will redeliver after the
    /// visibility window (eta not reached, or lineage busy elsewhere)
    Deferred,
}

/// Stateless dispatcher shared by all worker slots.
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn StateStore>,
    visibility_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn StateStore>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            store,
            visibility_timeout,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Process one delivery from `queue_name`.
    pub async fn process(
        &self,
        queue_name: &str,
        delivery: QueuedMessage<TaskMessage>,
    ) -> Result<DispatchOutcome> {
        let msg = &delivery.message;
        let receipt = &delivery.receipt_handle;
        let now = Utc::now();

        if msg.is_expired(now) {
            info!(task = %msg.task_name, task_id = %msg.task_id, "Delivery expired, revoking");
            let current = self.store.ensure_result(msg.task_id, &msg.task_name).await?;
            if !current.is_terminal() {
                self.store.revoke_result(msg.task_id).await?;
            }
            self.broker.ack(queue_name, receipt).await?;
            return Ok(DispatchOutcome::Skipped);
        }

        if let Some(remaining) = msg.time_until_due(now) {
            // Not yet due; push visibility out to the eta instead of spinning.
            debug!(
                task = %msg.task_name,
                task_id = %msg.task_id,
                due_in_ms = remaining.as_millis() as u64,
                "Delivery not due, deferring"
            );
            self.broker
                .extend_visibility(queue_name, receipt, remaining)
                .await?;
            return Ok(DispatchOutcome::Deferred);
        }

        let mut current = self.store.ensure_result(msg.task_id, &msg.task_name).await?;

        if current.state == TaskState::Revoked {
            info!(task = %msg.task_name, task_id = %msg.task_id, "Task revoked, skipping");
            self.broker.ack(queue_name, receipt).await?;
            return Ok(DispatchOutcome::Skipped);
        }

        if current.is_terminal() {
            // Redelivery of an already-finished lineage; acknowledging is the
            // idempotent thing to do, the recorded result is untouched.
            debug!(
                task = %msg.task_name,
                task_id = %msg.task_id,
                state = %current.state,
                "Lineage already terminal, dropping redelivery"
            );
            self.broker.ack(queue_name, receipt).await?;
            return Ok(DispatchOutcome::Skipped);
        }

        // A crash between RETRY and PENDING leaves the record parked on
        // RETRY; complete the re-entry edge before starting.
        if current.state == TaskState::Retry {
            let reentered = current.transitioned(TaskState::Pending)?;
            if self
                .store
                .compare_and_swap_result(msg.task_id, TaskState::Retry, &reentered)
                .await?
            {
                current = reentered;
            } else {
                current = self.store.ensure_result(msg.task_id, &msg.task_name).await?;
            }
        }

        if current.state != TaskState::Pending {
            return self.handle_lost_start_race(queue_name, msg, receipt).await;
        }

        let descriptor = match self.registry.resolve(&msg.task_name) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(task = %msg.task_name, task_id = %msg.task_id, "No handler registered");
                let failure = current.failed(TaskFailure::from(&err))?;
                self.store
                    .compare_and_swap_result(msg.task_id, current.state, &failure)
                    .await?;
                self.broker.nack(queue_name, receipt, false).await?;
                return Ok(DispatchOutcome::DeadLettered);
            }
        };

        let mut started = current.transitioned(TaskState::Started)?;
        started.retry_count = msg.retry_count;
        if !self
            .store
            .compare_and_swap_result(msg.task_id, current.state, &started)
            .await?
        {
            return self.handle_lost_start_race(queue_name, msg, receipt).await;
        }

        debug!(
            task = %msg.task_name,
            task_id = %msg.task_id,
            retry_count = msg.retry_count,
            "Handler starting"
        );

        // Heartbeat keeps the delivery invisible while a slow handler runs.
        let heartbeat = self.spawn_heartbeat(queue_name, receipt);

        let ctx = TaskContext::new(
            msg.task_id,
            msg.task_name.clone(),
            msg.retry_count,
            self.store.clone(),
        );
        let run = descriptor
            .handler
            .run(ctx, msg.args.clone(), msg.kwargs.clone());
        let outcome = tokio::time::timeout(descriptor.timeout, run).await;

        heartbeat.abort();

        let failure = match outcome {
            Ok(Ok(HandlerOutcome::Complete(value))) => {
                let done = started.succeeded(value)?;
                if self
                    .store
                    .compare_and_swap_result(msg.task_id, TaskState::Started, &done)
                    .await?
                {
                    info!(task = %msg.task_name, task_id = %msg.task_id, "Task succeeded");
                } else {
                    // Revocation raced the handler; the recorded state wins.
                    warn!(task = %msg.task_name, task_id = %msg.task_id, "Result write lost race");
                }
                self.broker.ack(queue_name, receipt).await?;
                return Ok(DispatchOutcome::Completed);
            }
            Ok(Ok(HandlerOutcome::Detached)) => {
                // The handler submitted an external job and gave the slot
                // back; the reconciler owns the terminal transition. Acking
                // here is safe because the persisted handle outlives us.
                info!(
                    task = %msg.task_name,
                    task_id = %msg.task_id,
                    "Handler detached to external job"
                );
                self.broker.ack(queue_name, receipt).await?;
                return Ok(DispatchOutcome::Completed);
            }
            Ok(Err(handler_err)) => WorkerError::handler_failed(
                &msg.task_name,
                handler_err.message,
                handler_err.retryable,
            ),
            Err(_elapsed) => {
                WorkerError::handler_timeout(&msg.task_name, descriptor.timeout.as_secs())
            }
        };

        if failure.is_retryable() && descriptor.retry_policy.allows_retry(msg.retry_count) {
            self.retry(queue_name, msg, receipt, &started, &failure, descriptor)
                .await
        } else {
            warn!(
                task = %msg.task_name,
                task_id = %msg.task_id,
                retry_count = msg.retry_count,
                error = %failure,
                "Task failed terminally, dead-lettering"
            );
            let failed = started.failed(TaskFailure::from(&failure))?;
            self.store
                .compare_and_swap_result(msg.task_id, TaskState::Started, &failed)
                .await?;
            self.broker.nack(queue_name, receipt, false).await?;
            Ok(DispatchOutcome::DeadLettered)
        }
    }

    /// Record RETRY, re-enter PENDING, and publish the delayed successor of
    /// the lineage. The in-hand delivery is acked only after the successor
    /// is on the queue.
    async fn retry(
        &self,
        queue_name: &str,
        msg: &TaskMessage,
        receipt: &crate::messaging::ReceiptHandle,
        started: &TaskResult,
        failure: &WorkerError,
        descriptor: &crate::registry::HandlerDescriptor,
    ) -> Result<DispatchOutcome> {
        let delay = descriptor.retry_policy.backoff.delay(msg.retry_count);
        info!(
            task = %msg.task_name,
            task_id = %msg.task_id,
            retry_count = msg.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Retrying task with backoff"
        );

        let mut retrying = started.transitioned(TaskState::Retry)?;
        retrying.retry_count = msg.retry_count + 1;
        self.store
            .compare_and_swap_result(msg.task_id, TaskState::Started, &retrying)
            .await?;
        let reentered = retrying.transitioned(TaskState::Pending)?;
        self.store
            .compare_and_swap_result(msg.task_id, TaskState::Retry, &reentered)
            .await?;

        let successor = msg.retry_successor(delay);
        if let Err(err) = self.broker.publish(queue_name, &successor).await {
            // Couldn't queue the successor; leave this delivery to redeliver
            // and run the attempt again.
            warn!(
                task = %msg.task_name,
                task_id = %msg.task_id,
                error = %err,
                "Retry publish failed, requeueing original delivery"
            );
            self.broker.nack(queue_name, receipt, true).await?;
            return Ok(DispatchOutcome::Deferred);
        }

        self.broker.ack(queue_name, receipt).await?;
        Ok(DispatchOutcome::Retried)
    }

    /// The STARTED swap failed: someone else owns the lineage right now.
    async fn handle_lost_start_race(
        &self,
        queue_name: &str,
        msg: &TaskMessage,
        receipt: &crate::messaging::ReceiptHandle,
    ) -> Result<DispatchOutcome> {
        let current = self.store.get_result(msg.task_id).await?;
        match current {
            Some(result) if result.state == TaskState::Revoked || result.is_terminal() => {
                self.broker.ack(queue_name, receipt).await?;
                Ok(DispatchOutcome::Skipped)
            }
            _ => {
                // Another slot is mid-flight; leave the delivery invisible so
                // it redelivers after the prior outcome is recorded.
                debug!(
                    task = %msg.task_name,
                    task_id = %msg.task_id,
                    "Lineage busy elsewhere, deferring delivery"
                );
                Ok(DispatchOutcome::Deferred)
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        queue_name: &str,
        receipt: &crate::messaging::ReceiptHandle,
    ) -> tokio::task::JoinHandle<()> {
        let broker = self.broker.clone();
        let queue_name = queue_name.to_string();
        let receipt = receipt.clone();
        let visibility_timeout = self.visibility_timeout;
        tokio::spawn(async move {
            let period = visibility_timeout / 2;
            loop {
                tokio::time::sleep(period).await;
                if let Err(err) = broker
                    .extend_visibility(&queue_name, &receipt, visibility_timeout)
                    .await
                {
                    warn!(queue = %queue_name, error = %err, "Visibility heartbeat failed");
                    break;
                }
            }
        })
    }
}
