//! # Worker
//!
//! Concurrency-bounded execution of broker deliveries: the per-message
//! dispatcher and the slot pool that drives it.

pub mod dispatch;
pub mod pool;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use pool::{WorkerPool, WorkerPoolConfig};
