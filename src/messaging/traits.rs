//! # Broker Trait
//!
//! Provider-agnostic contract for the message broker. Implementations must
//! provide at-least-once delivery: a received message stays invisible for
//! the visibility timeout and is redelivered if not acknowledged in time or
//! if the consuming process dies.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::MessagingResult;
use super::message::TaskMessage;
use super::types::{QueueStats, QueuedMessage, ReceiptHandle};

/// Core broker contract.
///
/// The engine never acknowledges a delivery before the handler has reached a
/// terminal outcome; idempotency under the resulting at-least-once semantics
/// is pushed to handlers via the task_id lineage.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create a queue if it doesn't exist (idempotent).
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()>;

    /// Publish a task envelope. Resolves once the broker has accepted the
    /// message (publisher confirm where the provider supports it).
    async fn publish(&self, queue_name: &str, message: &TaskMessage) -> MessagingResult<()>;

    /// Receive up to `max_messages` with the given visibility timeout.
    /// Returns an empty vec when the queue has no visible messages; callers
    /// poll on an interval rather than blocking.
    async fn receive(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<TaskMessage>>>;

    /// Acknowledge successful processing; removes the delivery permanently.
    async fn ack(&self, queue_name: &str, receipt_handle: &ReceiptHandle) -> MessagingResult<()>;

    /// Negative acknowledgment. `requeue = true` returns the message to the
    /// queue immediately; `requeue = false` dead-letters it.
    async fn nack(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        requeue: bool,
    ) -> MessagingResult<()>;

    /// Extend the visibility timeout of an in-flight delivery. Called as a
    /// heartbeat by slow handlers so the broker does not redeliver mid-run.
    async fn extend_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        extension: Duration,
    ) -> MessagingResult<()>;

    /// Queue statistics for monitoring and backpressure decisions.
    async fn queue_stats(&self, queue_name: &str) -> MessagingResult<QueueStats>;

    /// Verify the messaging backend is reachable.
    async fn health_check(&self) -> MessagingResult<bool>;

    /// Provider name for logging ("in_memory", "rabbitmq").
    fn provider_name(&self) -> &'static str;
}
