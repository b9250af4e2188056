#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Taskmanager Core
//!
//! Broker-driven task worker and scheduling engine: receives task
//! invocations over a message broker, executes them under bounded
//! concurrency, enqueues periodically-scheduled tasks, and orchestrates
//! long-running external pipeline jobs to completion.
//!
//! ## Architecture
//!
//! - [`messaging`] - broker client: task envelope, at-least-once delivery,
//!   in-memory and RabbitMQ providers
//! - [`registry`] - task name to handler resolution with retry/timeout
//!   contracts
//! - [`worker`] - concurrency-bounded execution slots and per-message
//!   dispatch
//! - [`scheduler`] - the beat: CAS-coordinated periodic enqueue, safe to
//!   run replicated
//! - [`orchestration`] - submit/poll/reconcile for external pipeline jobs
//! - [`store`] - durable state: task results, schedule marks, job handles
//! - [`state`] - the monotonic task state machine
//!
//! All cross-process coordination goes through the state store's
//! compare-and-swap primitives; callers observe task outcomes only through
//! the recorded [`store::TaskResult`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskmanager_core::config::WorkerConfig;
//! use taskmanager_core::registry::{handler_fn, HandlerOutcome, TaskRegistry};
//! use taskmanager_core::runtime::WorkerRuntime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(
//!     TaskRegistry::builder("default")
//!         .register(
//!             "echo",
//!             handler_fn(|_ctx, args, _kwargs| async move {
//!                 Ok(HandlerOutcome::Complete(serde_json::json!({ "echo": args })))
//!             }),
//!         )?
//!         .build(),
//! );
//!
//! let mut runtime = WorkerRuntime::builder(WorkerConfig::default(), registry)
//!     .build()
//!     .await?;
//! runtime.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use messaging::TaskMessage;
pub use runtime::WorkerRuntime;
pub use state::{BackendJobState, TaskState};
pub use store::TaskResult;
