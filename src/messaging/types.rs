//! # Messaging Types
//!
//! Provider-agnostic wrapper types for received messages.

use std::time::Duration;

/// Handle for acknowledging, rejecting, or extending a received message.
///
/// The format is provider-specific: the AMQP provider stores the delivery
/// tag, the in-memory provider an internal sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReceiptHandle {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

/// A message received from a queue, together with delivery metadata.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    /// Handle for acknowledging this delivery
    pub receipt_handle: ReceiptHandle,

    /// The deserialized message payload
    pub message: T,

    /// Number of times this message has been delivered. Increments on each
    /// visibility-timeout lapse; useful for poison-message detection.
    pub receive_count: u32,

    /// When the message was originally enqueued
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl<T> QueuedMessage<T> {
    pub fn new(
        receipt_handle: ReceiptHandle,
        message: T,
        receive_count: u32,
        enqueued_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            receipt_handle,
            message,
            receive_count,
            enqueued_at,
        }
    }
}

/// Queue statistics for monitoring and backpressure decisions.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queue_name: String,

    /// Total number of messages in the queue (visible + in flight)
    pub message_count: u64,

    /// Messages currently invisible to other consumers, where the provider
    /// tracks this (the AMQP provider does not).
    pub in_flight_count: Option<u64>,

    /// Age of the oldest message, for detecting stuck queues
    pub oldest_message_age: Option<Duration>,
}

impl QueueStats {
    pub fn new(queue_name: impl Into<String>, message_count: u64) -> Self {
        Self {
            queue_name: queue_name.into(),
            message_count,
            in_flight_count: None,
            oldest_message_age: None,
        }
    }

    pub fn with_in_flight_count(mut self, count: u64) -> Self {
        self.in_flight_count = Some(count);
        self
    }

    pub fn with_oldest_message_age(mut self, age: Duration) -> Self {
        self.oldest_message_age = Some(age);
        self
    }
}
