//! # Circuit Breaker
//!
//! Fault isolation for calls to external collaborators (the pipeline
//! backend). Classic three-state pattern: Closed (normal), Open (failing
//! fast), HalfOpen (probing recovery).

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

/// Current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub open_timeout: Duration,
    /// Consecutive half-open successes before closing again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Error wrapper distinguishing a fast-failed call from a real failure.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("operation failed: {0}")]
    OperationFailed(E),
}

/// Circuit breaker with atomic state management.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    config: CircuitBreakerConfig,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            config,
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Execute an operation under breaker protection.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow_call().await {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at.lock().await;
                match *opened_at {
                    Some(at) if at.elapsed() >= self.config.open_timeout => {
                        drop(opened_at);
                        self.transition(CircuitState::HalfOpen);
                        self.half_open_successes.store(0, Ordering::Release);
                        true
                    }
                    Some(_) => false,
                    None => true,
                }
            }
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition(CircuitState::Closed);
                info!(component = %self.name, "Circuit closed after recovery");
            }
        }
    }

    async fn record_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.open().await;
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn open(&self) {
        self.transition(CircuitState::Open);
        *self.opened_at.lock().await = Some(Instant::now());
        warn!(component = %self.name, "Circuit opened");
    }

    fn transition(&self, next: CircuitState) {
        self.state.store(next as u8, Ordering::Release);
    }
}
