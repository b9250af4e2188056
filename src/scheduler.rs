//! # Beat Scheduler
//!
//! Cadence-based enqueue of recurring tasks. Every tick, each entry whose
//! cadence has elapsed since its persisted `last_fired_at` is attempted via
//! compare-and-swap on the state store; only the winning instance publishes,
//! so redundant beat replicas are safe. Missed windows are skipped, never
//! backfilled: the next successful tick fires once and advances the mark to
//! now.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Map;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::messaging::{Broker, TaskMessage};
use crate::store::StateStore;

/// When a schedule entry fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed interval between firings
    Every(Duration),
    /// Cron expression (seconds-resolution, `cron` crate syntax)
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    pub fn cron(expression: &str) -> Result<Self> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            WorkerError::configuration(format!("invalid cron expression {expression:?}: {e}"))
        })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Whether a firing is due at `now`, given the last recorded firing.
    /// A never-fired entry is due immediately.
    pub fn is_due(&self, last_fired_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self, last_fired_at) {
            (_, None) => true,
            (Self::Every(interval), Some(last)) => {
                let elapsed = now - last;
                elapsed
                    .to_std()
                    .map(|elapsed| elapsed >= *interval)
                    .unwrap_or(false)
            }
            (Self::Cron(schedule), Some(last)) => schedule
                .after(&last)
                .next()
                .map(|next| next <= now)
                .unwrap_or(false),
        }
    }
}

/// One recurring task in the beat schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Unique entry name; the CAS key in the state store
    pub name: String,
    /// Task to publish when the entry fires
    pub task_name: String,
    /// Keyword arguments for the published message
    pub kwargs: Map<String, serde_json::Value>,
    pub cadence: Cadence,
    /// Queue override; None = the beat's default queue
    pub queue: Option<String>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            kwargs: Map::new(),
            cadence,
            queue: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, serde_json::Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    fn build_message(&self) -> TaskMessage {
        TaskMessage::new(&self.task_name).with_kwargs(self.kwargs.clone())
    }
}

/// Beat configuration.
#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub tick_interval: Duration,
    pub default_queue: String,
    pub entries: Vec<ScheduleEntry>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            default_queue: "default".to_string(),
            entries: Vec::new(),
        }
    }
}

/// The beat scheduler. Multiple instances may run concurrently; they
/// coordinate only through the state store's CAS primitive.
pub struct Beat {
    broker: Arc<dyn Broker>,
    store: Arc<dyn StateStore>,
    config: BeatConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Beat {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn StateStore>, config: BeatConfig) -> Self {
        Self {
            broker,
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// One pass over every entry. Returns how many entries this instance
    /// won and published.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;

        for entry in &self.config.entries {
            let last = self.store.schedule_last_fired(&entry.name).await?;
            if !entry.cadence.is_due(last, now) {
                continue;
            }

            // Only the replica that wins the swap publishes for this window.
            if !self
                .store
                .compare_and_swap_schedule(&entry.name, last, now)
                .await?
            {
                debug!(entry = %entry.name, "Lost schedule CAS, another beat fired");
                continue;
            }

            let message = entry.build_message();
            let queue = entry
                .queue
                .as_deref()
                .unwrap_or(&self.config.default_queue);
            match self.broker.publish(queue, &message).await {
                Ok(()) => {
                    info!(
                        entry = %entry.name,
                        task = %entry.task_name,
                        task_id = %message.task_id,
                        queue,
                        "Beat fired"
                    );
                    fired += 1;
                }
                Err(err) => {
                    // The mark already advanced; this window is spent. The
                    // entry fires again next window rather than double-firing.
                    warn!(entry = %entry.name, error = %err, "Beat publish failed");
                }
            }
        }

        Ok(fired)
    }

    /// Spawn the tick loop.
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::configuration("beat already running"));
        }

        info!(
            entries = self.config.entries.len(),
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "Beat scheduler starting"
        );

        let beat = self.clone();
        Ok(tokio::spawn(async move {
            while beat.running.load(Ordering::Acquire) {
                if let Err(err) = beat.run_once(Utc::now()).await {
                    warn!(error = %err, "Beat tick failed");
                }
                tokio::select! {
                    () = tokio::time::sleep(beat.config.tick_interval) => {}
                    () = beat.shutdown.notified() => break,
                }
            }
            info!("Beat scheduler stopped");
        }))
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_cadence_due_logic() {
        let cadence = Cadence::every(Duration::from_secs(3600));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(cadence.is_due(None, now));
        assert!(!cadence.is_due(Some(now - chrono::Duration::minutes(30)), now));
        assert!(cadence.is_due(Some(now - chrono::Duration::hours(1)), now));
        assert!(cadence.is_due(Some(now - chrono::Duration::hours(50)), now));
    }

    #[test]
    fn cron_cadence_due_logic() {
        // Midnight every day, seconds-resolution cron syntax.
        let cadence = Cadence::cron("0 0 0 * * *").unwrap();
        let last = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let before_midnight = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        assert!(!cadence.is_due(Some(last), before_midnight));

        let after_midnight = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 30).unwrap();
        assert!(cadence.is_due(Some(last), after_midnight));
    }

    #[test]
    fn invalid_cron_is_a_configuration_error() {
        let err = Cadence::cron("not a cron line").unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }
}
