//! # Messaging Error Types
//!
//! Structured error types for broker operations using thiserror.

use thiserror::Error;

/// Errors raised by broker providers.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("broker connection error: {message}")]
    Connection { message: String },

    #[error("queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("queue creation failed: {queue_name}: {message}")]
    QueueCreation { queue_name: String, message: String },

    #[error("publish to {queue_name} failed: {message}")]
    Publish { queue_name: String, message: String },

    #[error("receive from {queue_name} failed: {message}")]
    Receive { queue_name: String, message: String },

    #[error("ack on {queue_name} failed for {receipt}: {message}")]
    Ack {
        queue_name: String,
        receipt: String,
        message: String,
    },

    #[error("nack on {queue_name} failed for {receipt}: {message}")]
    Nack {
        queue_name: String,
        receipt: String,
        message: String,
    },

    #[error("invalid receipt handle: {handle}")]
    InvalidReceiptHandle { handle: String },

    #[error("message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("message serialization error: {message}")]
    Serialization { message: String },

    #[error("message deserialization error: {message}")]
    Deserialization { message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_creation(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueCreation {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn publish(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn receive(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Receive {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn ack(
        queue_name: impl Into<String>,
        receipt: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Ack {
            queue_name: queue_name.into(),
            receipt: receipt.into(),
            message: message.into(),
        }
    }

    pub fn nack(
        queue_name: impl Into<String>,
        receipt: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Nack {
            queue_name: queue_name.into(),
            receipt: receipt.into(),
            message: message.into(),
        }
    }

    pub fn invalid_receipt_handle(handle: impl Into<String>) -> Self {
        Self::InvalidReceiptHandle {
            handle: handle.into(),
        }
    }

    pub fn message_not_found(message_id: impl Into<String>) -> Self {
        Self::MessageNotFound {
            message_id: message_id.into(),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            Self::Deserialization {
                message: err.to_string(),
            }
        } else {
            Self::Serialization {
                message: err.to_string(),
            }
        }
    }
}

impl From<MessagingError> for crate::error::WorkerError {
    fn from(err: MessagingError) -> Self {
        crate::error::WorkerError::broker_unavailable(err.to_string())
    }
}

/// Result type alias for broker operations.
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;
