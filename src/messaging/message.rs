//! # Task Message Envelope
//!
//! The immutable envelope published to the broker for every task
//! invocation. A `task_id` identifies one logical invocation across its
//! entire retry lineage; retries reuse the task_id and increment
//! `retry_count`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Immutable task invocation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Name of the registered handler to invoke
    pub task_name: String,
    /// Positional arguments, opaque to the engine
    pub args: Vec<Value>,
    /// Keyword arguments, opaque to the engine
    pub kwargs: Map<String, Value>,
    /// Globally unique id for the invocation lineage, assigned at publish time
    pub task_id: Uuid,
    /// Earliest time the message may be executed
    pub eta: Option<DateTime<Utc>>,
    /// Time after which the delivery is discarded without execution
    pub expires: Option<DateTime<Utc>>,
    /// Number of retries already attempted for this lineage
    pub retry_count: u32,
    /// When this envelope was published
    pub published_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Create a new envelope with a fresh task_id.
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            task_id: Uuid::new_v4(),
            eta: None,
            expires: None,
            retry_count: 0,
            published_at: Utc::now(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Build the next delivery of this lineage after a retryable failure.
    ///
    /// The task_id is preserved, the retry count incremented, and execution
    /// deferred by `delay`. The expiry carries over unchanged.
    pub fn retry_successor(&self, delay: Duration) -> Self {
        let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
        Self {
            task_name: self.task_name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            task_id: self.task_id,
            eta: Some(Utc::now() + delay),
            expires: self.expires,
            retry_count: self.retry_count + 1,
            published_at: Utc::now(),
        }
    }

    /// Whether the delivery has outlived its `expires` timestamp.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|exp| now >= exp).unwrap_or(false)
    }

    /// Whether the `eta` allows execution yet.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta.map(|eta| now >= eta).unwrap_or(true)
    }

    /// Time remaining until the message becomes due, if any.
    pub fn time_until_due(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.eta.and_then(|eta| (eta - now).to_std().ok())
    }
}
