//! # Messaging
//!
//! Broker client layer: the task envelope, the provider-agnostic `Broker`
//! trait, and its in-memory and RabbitMQ implementations.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod rabbitmq;
pub mod traits;
pub mod types;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryBroker;
pub use message::TaskMessage;
pub use rabbitmq::RabbitBroker;
pub use traits::Broker;
pub use types::{QueueStats, QueuedMessage, ReceiptHandle};
