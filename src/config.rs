//! # Worker Configuration
//!
//! Injected configuration object recognized by every component: broker URI,
//! state store URL, worker-slot count, beat schedule, retry policy, and
//! external-job poll pacing. Loaded from a TOML file layered with
//! `TASKMANAGER_*` environment overrides; all values have defaults so a
//! bare process comes up in local in-memory mode.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Map;

use crate::error::{Result, WorkerError};
use crate::orchestration::OrchestratorConfig;
use crate::registry::RetryPolicy;
use crate::resilience::BackoffPolicy;
use crate::scheduler::{BeatConfig, Cadence, ScheduleEntry};
use crate::worker::WorkerPoolConfig;

/// One beat schedule entry as configured. Exactly one of `interval_secs` or
/// `cron` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct BeatEntryConfig {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub kwargs: Option<Map<String, serde_json::Value>>,
}

/// Retry budget and backoff, tunable per deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 600_000,
        }
    }
}

/// External-job poll pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_base_secs: u64,
    pub poll_interval_max_secs: u64,
    pub max_wall_clock_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_base_secs: 5,
            poll_interval_max_secs: 600,
            max_wall_clock_secs: 24 * 3600,
            reconcile_interval_secs: 30,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Broker endpoint: "memory" or an amqp:// URI
    pub broker_uri: String,
    /// Postgres URL for the durable state store; None = in-memory store
    pub database_url: Option<String>,
    /// Worker execution slots
    pub concurrency: usize,
    /// Queues this worker drains
    pub queues: Vec<String>,
    /// Default routing queue for tasks without an explicit one
    pub default_queue: String,
    /// AMQP consumer prefetch
    pub prefetch_count: u16,
    pub visibility_timeout_secs: u64,
    /// Sleep between polls when the queues are empty
    pub poll_interval_ms: u64,
    /// Whether this process runs the beat scheduler
    pub beat_enabled: bool,
    pub beat_tick_interval_secs: u64,
    pub schedule: Vec<BeatEntryConfig>,
    pub retry: RetryConfig,
    pub orchestrator: OrchestratorSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_uri: "memory".to_string(),
            database_url: None,
            concurrency: 4,
            queues: vec!["default".to_string()],
            default_queue: "default".to_string(),
            prefetch_count: 10,
            visibility_timeout_secs: 30,
            poll_interval_ms: 200,
            beat_enabled: false,
            beat_tick_interval_secs: 30,
            schedule: Vec::new(),
            retry: RetryConfig::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file layered with `TASKMANAGER_*` env overrides
    /// (e.g. `TASKMANAGER_CONCURRENCY=16`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("TASKMANAGER").separator("__"))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| WorkerError::configuration(e.to_string()))
    }

    /// Load from environment variables only.
    pub fn from_env() -> Result<Self> {
        Config::builder()
            .add_source(Environment::with_prefix("TASKMANAGER").separator("__"))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| WorkerError::configuration(e.to_string()))
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.concurrency,
            queues: self.queues.clone(),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            BackoffPolicy::new(
                Duration::from_millis(self.retry.backoff_base_ms),
                Duration::from_millis(self.retry.backoff_max_ms),
            )
            .with_jitter(),
        )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval_base: Duration::from_secs(self.orchestrator.poll_interval_base_secs),
            poll_interval_max: Duration::from_secs(self.orchestrator.poll_interval_max_secs),
            max_wall_clock: Duration::from_secs(self.orchestrator.max_wall_clock_secs),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.reconcile_interval_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Materialize the beat schedule, validating every cadence.
    pub fn beat_config(&self) -> Result<BeatConfig> {
        let mut entries = Vec::with_capacity(self.schedule.len());
        for entry in &self.schedule {
            let cadence = match (&entry.interval_secs, &entry.cron) {
                (Some(secs), None) => Cadence::every(Duration::from_secs(*secs)),
                (None, Some(expr)) => Cadence::cron(expr)?,
                _ => {
                    return Err(WorkerError::configuration(format!(
                        "schedule entry {:?} needs exactly one of interval_secs or cron",
                        entry.name
                    )));
                }
            };
            let mut schedule_entry = ScheduleEntry::new(&entry.name, &entry.task, cadence)
                .with_kwargs(entry.kwargs.clone().unwrap_or_default());
            if let Some(queue) = &entry.queue {
                schedule_entry = schedule_entry.with_queue(queue);
            }
            entries.push(schedule_entry);
        }

        Ok(BeatConfig {
            tick_interval: Duration::from_secs(self.beat_tick_interval_secs),
            default_queue: self.default_queue.clone(),
            entries,
        })
    }

    /// Whether the broker URI selects the in-memory provider.
    pub fn uses_memory_broker(&self) -> bool {
        self.broker_uri == "memory"
    }
}
