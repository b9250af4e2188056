//! # In-Memory Broker
//!
//! Thread-safe in-memory queue implementation for tests and single-process
//! deployments. Simulates visibility timeouts so the worker pool sees the
//! same at-least-once semantics it gets from a real broker, including a
//! per-queue dead-letter store for rejected messages.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::errors::{MessagingError, MessagingResult};
use super::message::TaskMessage;
use super::traits::Broker;
use super::types::{QueueStats, QueuedMessage, ReceiptHandle};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    envelope: TaskMessage,
    enqueued_at: DateTime<Utc>,
    /// When the message becomes visible again (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dead_letters: VecDeque<StoredMessage>,
    next_id: u64,
    total_published: u64,
    total_acked: u64,
}

/// In-memory broker with visibility-timeout semantics.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-dead-lettered) messages in a queue.
    pub async fn queue_length(&self, queue_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Dead-lettered envelopes for a queue, oldest first.
    pub async fn dead_letters(&self, queue_name: &str) -> Vec<TaskMessage> {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.dead_letters.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop every message from a queue, including dead letters.
    pub async fn purge(&self, queue_name: &str) {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get_mut(queue_name) {
            queue.messages.clear();
            queue.dead_letters.clear();
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        let mut queues = self.queues.write().await;
        queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue_name: &str, message: &TaskMessage) -> MessagingResult<()> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        queue.next_id += 1;
        queue.total_published += 1;
        queue.messages.push_back(StoredMessage {
            id: queue.next_id,
            envelope: message.clone(),
            enqueued_at: Utc::now(),
            visible_at: None,
            receive_count: 0,
        });

        Ok(())
    }

    async fn receive(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<TaskMessage>>> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let now = Utc::now();
        let invisible_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut received = Vec::new();

        for msg in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            let is_visible = msg.visible_at.map(|vt| vt <= now).unwrap_or(true);
            if is_visible {
                msg.visible_at = Some(invisible_until);
                msg.receive_count += 1;
                received.push(QueuedMessage::new(
                    ReceiptHandle::from(msg.id),
                    msg.envelope.clone(),
                    msg.receive_count,
                    msg.enqueued_at,
                ));
            }
        }

        Ok(received)
    }

    async fn ack(&self, queue_name: &str, receipt_handle: &ReceiptHandle) -> MessagingResult<()> {
        let message_id: u64 = receipt_handle
            .as_str()
            .parse()
            .map_err(|_| MessagingError::invalid_receipt_handle(receipt_handle.as_str()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        match queue.messages.iter().position(|m| m.id == message_id) {
            Some(pos) => {
                queue.messages.remove(pos);
                queue.total_acked += 1;
                Ok(())
            }
            None => Err(MessagingError::message_not_found(message_id.to_string())),
        }
    }

    async fn nack(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        requeue: bool,
    ) -> MessagingResult<()> {
        let message_id: u64 = receipt_handle
            .as_str()
            .parse()
            .map_err(|_| MessagingError::invalid_receipt_handle(receipt_handle.as_str()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        if requeue {
            match queue.messages.iter_mut().find(|m| m.id == message_id) {
                Some(msg) => {
                    msg.visible_at = None;
                    Ok(())
                }
                None => Err(MessagingError::message_not_found(message_id.to_string())),
            }
        } else {
            match queue.messages.iter().position(|m| m.id == message_id) {
                Some(pos) => {
                    if let Some(msg) = queue.messages.remove(pos) {
                        queue.dead_letters.push_back(msg);
                    }
                    Ok(())
                }
                None => Err(MessagingError::message_not_found(message_id.to_string())),
            }
        }
    }

    async fn extend_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        extension: Duration,
    ) -> MessagingResult<()> {
        let message_id: u64 = receipt_handle
            .as_str()
            .parse()
            .map_err(|_| MessagingError::invalid_receipt_handle(receipt_handle.as_str()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        match queue.messages.iter_mut().find(|m| m.id == message_id) {
            Some(msg) => {
                let extension = chrono::Duration::from_std(extension)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                msg.visible_at = Some(Utc::now() + extension);
                Ok(())
            }
            None => Err(MessagingError::message_not_found(message_id.to_string())),
        }
    }

    async fn queue_stats(&self, queue_name: &str) -> MessagingResult<QueueStats> {
        let queues = self.queues.read().await;
        let queue = queues
            .get(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let now = Utc::now();
        let in_flight = queue
            .messages
            .iter()
            .filter(|m| m.visible_at.map(|vt| vt > now).unwrap_or(false))
            .count() as u64;

        let mut stats = QueueStats::new(queue_name, queue.messages.len() as u64)
            .with_in_flight_count(in_flight);

        if let Some(front) = queue.messages.front() {
            if let Ok(age) = (now - front.enqueued_at).to_std() {
                stats = stats.with_oldest_message_age(age);
            }
        }

        Ok(stats)
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(name: &str) -> TaskMessage {
        TaskMessage::new(name)
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let broker = InMemoryBroker::new();
        broker.ensure_queue("default").await.unwrap();

        broker.publish("default", &msg("echo")).await.unwrap();

        let received = broker
            .receive("default", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.task_name, "echo");
        assert_eq!(received[0].receive_count, 1);
    }

    #[tokio::test]
    async fn received_message_is_invisible_until_timeout() {
        let broker = InMemoryBroker::new();
        broker.ensure_queue("default").await.unwrap();
        broker.publish("default", &msg("echo")).await.unwrap();

        let first = broker
            .receive("default", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = broker
            .receive("default", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(second.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let third = broker
            .receive("default", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].receive_count, 2);
    }

    #[tokio::test]
    async fn ack_removes_permanently() {
        let broker = InMemoryBroker::new();
        broker.ensure_queue("default").await.unwrap();
        broker.publish("default", &msg("echo")).await.unwrap();

        let received = broker
            .receive("default", 1, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .ack("default", &received[0].receipt_handle)
            .await
            .unwrap();

        assert_eq!(broker.queue_length("default").await, 0);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.ensure_queue("default").await.unwrap();
        broker.publish("default", &msg("poison")).await.unwrap();

        let received = broker
            .receive("default", 1, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .nack("default", &received[0].receipt_handle, false)
            .await
            .unwrap();

        assert_eq!(broker.queue_length("default").await, 0);
        let dead = broker.dead_letters("default").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_name, "poison");
    }

    #[tokio::test]
    async fn nack_with_requeue_restores_visibility() {
        let broker = InMemoryBroker::new();
        broker.ensure_queue("default").await.unwrap();
        broker.publish("default", &msg("echo")).await.unwrap();

        let received = broker
            .receive("default", 1, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .nack("default", &received[0].receipt_handle, true)
            .await
            .unwrap();

        let again = broker
            .receive("default", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn unknown_queue_is_an_error() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("missing", &msg("echo")).await.unwrap_err();
        assert!(matches!(err, MessagingError::QueueNotFound { .. }));
    }
}
