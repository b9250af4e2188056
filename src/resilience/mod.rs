//! # Resilience
//!
//! Backoff policies and circuit breaking shared by the broker client, the
//! retry machinery, and the external-job poll loops.

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{BackoffPolicy, PollInterval};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
