//! # Task Registry
//!
//! Typed mapping from task name to a handler descriptor (handler, retry
//! policy, timeout, queue). Registration happens once at process start
//! through the builder, which fails fast on duplicates; the built registry
//! is read-only, so resolution needs no locking. Unknown task names resolve
//! to an error and the delivery is dead-lettered, since an unknown task is
//! evidence of a producer/consumer version mismatch.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::resilience::BackoffPolicy;
use crate::store::StateStore;

/// Failure returned by a handler. The handler decides retryability; the
/// dispatch layer enforces the retry budget.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// Transient failure; eligible for redelivery with backoff.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent failure; dead-letter immediately.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The task is done; the value becomes the recorded result.
    Complete(Value),
    /// The handler submitted an external job and returned the slot. The
    /// reconciler records the terminal result when the job finishes; the
    /// TaskResult stays STARTED until then.
    Detached,
}

impl HandlerOutcome {
    /// Shorthand for a unit success.
    pub fn done() -> Self {
        Self::Complete(Value::Null)
    }
}

/// Execution context handed to every handler invocation.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub retry_count: u32,
    store: Arc<dyn StateStore>,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        task_name: impl Into<String>,
        retry_count: u32,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            retry_count,
            store,
        }
    }

    /// Cooperative revocation check for long-running handlers. There is no
    /// preemption; a handler that never polls this runs to completion.
    pub async fn is_revoked(&self) -> bool {
        matches!(
            self.store.get_result(self.task_id).await,
            Ok(Some(result)) if result.state == crate::state::TaskState::Revoked
        )
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }
}

/// A registered task implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(
        &self,
        ctx: TaskContext,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> std::result::Result<HandlerOutcome, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<HandlerOutcome, HandlerError>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: TaskContext,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> std::result::Result<HandlerOutcome, HandlerError> {
        (self.0)(ctx, args, kwargs).await
    }
}

/// Wrap an async closure as a `TaskHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<HandlerOutcome, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-task retry budget and backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default().with_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Whether a delivery with the given retry count has budget left.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Registration options beyond the handler itself.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    /// Routing key / queue for this task category; None = the registry's
    /// default queue.
    pub queue: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
            queue: None,
        }
    }
}

/// Resolved execution contract for one task name.
pub struct HandlerDescriptor {
    pub task_name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    pub queue: String,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("task_name", &self.task_name)
            .field("handler", &"<dyn TaskHandler>")
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Builder for the process-wide registry.
#[derive(Debug)]
pub struct TaskRegistryBuilder {
    default_queue: String,
    handlers: HashMap<String, HandlerDescriptor>,
}

impl TaskRegistryBuilder {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register with default options.
    pub fn register(
        self,
        task_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self> {
        self.register_with(task_name, handler, TaskOptions::default())
    }

    /// Register with explicit retry policy, timeout, and queue.
    pub fn register_with(
        mut self,
        task_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<Self> {
        let task_name = task_name.into();
        if self.handlers.contains_key(&task_name) {
            return Err(WorkerError::duplicate_task(task_name));
        }
        let queue = options.queue.unwrap_or_else(|| self.default_queue.clone());
        self.handlers.insert(
            task_name.clone(),
            HandlerDescriptor {
                task_name,
                handler,
                retry_policy: options.retry_policy,
                timeout: options.timeout,
                queue,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            default_queue: self.default_queue,
            handlers: self.handlers,
        }
    }
}

/// Read-only task registry, built once at startup.
pub struct TaskRegistry {
    default_queue: String,
    handlers: HashMap<String, HandlerDescriptor>,
}

impl TaskRegistry {
    pub fn builder(default_queue: impl Into<String>) -> TaskRegistryBuilder {
        TaskRegistryBuilder::new(default_queue)
    }

    /// Resolve a task name to its descriptor.
    pub fn resolve(&self, task_name: &str) -> Result<&HandlerDescriptor> {
        self.handlers
            .get(task_name)
            .ok_or_else(|| WorkerError::unknown_task(task_name))
    }

    /// Queue for a task name; unknown names fall back to the default queue
    /// (publishing to an unknown task is the consumer's error to report).
    pub fn queue_for(&self, task_name: &str) -> &str {
        self.handlers
            .get(task_name)
            .map(|d| d.queue.as_str())
            .unwrap_or(&self.default_queue)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Every queue any registered task routes to, default queue included.
    pub fn queues(&self) -> BTreeSet<String> {
        let mut queues: BTreeSet<String> =
            self.handlers.values().map(|d| d.queue.clone()).collect();
        queues.insert(self.default_queue.clone());
        queues
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
