//! Beat scheduler integration: CAS-coordinated firing across redundant
//! replicas, skip-ahead on missed windows, and cron cadences.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use taskmanager_core::messaging::{Broker, InMemoryBroker};
use taskmanager_core::scheduler::{Beat, BeatConfig, Cadence, ScheduleEntry};
use taskmanager_core::store::{InMemoryStateStore, StateStore};

fn nightly_config() -> BeatConfig {
    BeatConfig {
        tick_interval: Duration::from_secs(30),
        default_queue: "default".to_string(),
        entries: vec![ScheduleEntry::new(
            "nightly_report",
            "nightly_report",
            Cadence::every(Duration::from_secs(24 * 3600)),
        )],
    }
}

async fn queue_len(broker: &Arc<InMemoryBroker>) -> usize {
    broker.queue_length("default").await
}

#[tokio::test]
async fn replicated_beats_fire_once_per_window() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.ensure_queue("default").await.unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    // Three redundant replicas over the same broker and store.
    let beats: Vec<Beat> = (0..3)
        .map(|_| {
            Beat::new(
                broker.clone() as Arc<dyn Broker>,
                store.clone(),
                nightly_config(),
            )
        })
        .collect();

    // All replicas race the same elapsed window concurrently.
    let now = Utc::now();
    let (a, b, c) = tokio::join!(
        beats[0].run_once(now),
        beats[1].run_once(now),
        beats[2].run_once(now)
    );
    let fired = a.unwrap() + b.unwrap() + c.unwrap();
    assert_eq!(fired, 1, "exactly one replica wins the window");
    assert_eq!(queue_len(&broker).await, 1);

    // Replicas keep ticking every 30s inside the same 24h window.
    for i in 1..10 {
        let tick = now + chrono::Duration::seconds(30 * i);
        for beat in &beats {
            assert_eq!(beat.run_once(tick).await.unwrap(), 0);
        }
    }
    assert_eq!(queue_len(&broker).await, 1);

    // Next window: exactly one more firing.
    let next_window = now + chrono::Duration::hours(24) + chrono::Duration::seconds(1);
    let fired: usize = {
        let (a, b, c) = tokio::join!(
            beats[0].run_once(next_window),
            beats[1].run_once(next_window),
            beats[2].run_once(next_window)
        );
        a.unwrap() + b.unwrap() + c.unwrap()
    };
    assert_eq!(fired, 1);
    assert_eq!(queue_len(&broker).await, 2);
}

#[tokio::test]
async fn missed_windows_are_skipped_not_backfilled() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.ensure_queue("default").await.unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    // The entry last fired 50 hours ago (the process was down for two
    // windows).
    let now = Utc::now();
    let long_ago = now - chrono::Duration::hours(50);
    assert!(store
        .compare_and_swap_schedule("nightly_report", None, long_ago)
        .await
        .unwrap());

    let beat = Beat::new(
        broker.clone() as Arc<dyn Broker>,
        store.clone(),
        nightly_config(),
    );

    // One firing, not two; the mark advances to now.
    assert_eq!(beat.run_once(now).await.unwrap(), 1);
    assert_eq!(queue_len(&broker).await, 1);
    assert_eq!(beat.run_once(now).await.unwrap(), 0);

    let mark = store.schedule_last_fired("nightly_report").await.unwrap();
    assert_eq!(mark, Some(now));
}

#[tokio::test]
async fn fired_message_routes_to_entry_queue() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.ensure_queue("default").await.unwrap();
    broker.ensure_queue("reports").await.unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("window".into(), serde_json::json!("24h"));
    let config = BeatConfig {
        tick_interval: Duration::from_secs(30),
        default_queue: "default".to_string(),
        entries: vec![ScheduleEntry::new(
            "nightly_report",
            "nightly_report",
            Cadence::every(Duration::from_secs(3600)),
        )
        .with_queue("reports")
        .with_kwargs(kwargs)],
    };
    let beat = Beat::new(broker.clone() as Arc<dyn Broker>, store, config);

    assert_eq!(beat.run_once(Utc::now()).await.unwrap(), 1);
    assert_eq!(broker.queue_length("default").await, 0);
    assert_eq!(broker.queue_length("reports").await, 1);

    let delivered = broker
        .receive("reports", 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(delivered[0].message.task_name, "nightly_report");
    assert_eq!(
        delivered[0].message.kwargs.get("window"),
        Some(&serde_json::json!("24h"))
    );
}

#[tokio::test]
async fn cron_entry_fires_after_boundary() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.ensure_queue("default").await.unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let config = BeatConfig {
        tick_interval: Duration::from_secs(30),
        default_queue: "default".to_string(),
        entries: vec![ScheduleEntry::new(
            "midnight_sweep",
            "storage_cleanup",
            Cadence::cron("0 0 0 * * *").unwrap(),
        )],
    };
    let beat = Beat::new(broker.clone() as Arc<dyn Broker>, store.clone(), config);

    use chrono::TimeZone;
    let just_fired = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 5).unwrap();
    assert!(store
        .compare_and_swap_schedule("midnight_sweep", None, just_fired)
        .await
        .unwrap());

    // Later the same day: nothing due.
    let evening = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 22, 0, 0).unwrap();
    assert_eq!(beat.run_once(evening).await.unwrap(), 0);

    // Past the next midnight boundary: one firing.
    let next_day = chrono::Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 40).unwrap();
    assert_eq!(beat.run_once(next_day).await.unwrap(), 1);
    assert_eq!(queue_len(&broker).await, 1);
}
