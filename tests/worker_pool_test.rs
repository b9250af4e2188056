//! Worker pool integration: dispatch outcomes, retry budget, idempotence,
//! and revocation, all against the in-memory broker and store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskmanager_core::config::WorkerConfig;
use taskmanager_core::messaging::{InMemoryBroker, TaskMessage};
use taskmanager_core::registry::{
    handler_fn, HandlerError, HandlerOutcome, RetryPolicy, TaskOptions, TaskRegistry,
};
use taskmanager_core::resilience::BackoffPolicy;
use taskmanager_core::runtime::WorkerRuntime;
use taskmanager_core::state::TaskState;
use taskmanager_core::store::InMemoryStateStore;

use common::wait_for_state;

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.concurrency = 2;
    config.poll_interval_ms = 10;
    config.visibility_timeout_secs = 2;
    config
}

fn fast_retry(max_retries: u32) -> TaskOptions {
    TaskOptions {
        retry_policy: RetryPolicy::new(
            max_retries,
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(20)),
        ),
        timeout: Duration::from_secs(5),
        queue: None,
    }
}

async fn start_runtime(
    registry: TaskRegistry,
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryStateStore>,
) -> WorkerRuntime {
    let mut runtime = WorkerRuntime::builder(test_config(), Arc::new(registry))
        .with_broker(broker)
        .with_store(store)
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn successful_task_records_monotonic_transitions() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register(
            "echo",
            handler_fn(move |_ctx, args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::Complete(json!({ "echo": args })))
                }
            }),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker, store.clone()).await;

    let message = TaskMessage::new("echo").with_args(vec![json!("S1")]);
    let task_id = runtime.publish(message).await.unwrap();

    let store_dyn = runtime.store();
    let result = wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Success,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(result.result, Some(json!({ "echo": ["S1"] })));
    let states: Vec<TaskState> = result.transitions.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![TaskState::Pending, TaskState::Started, TaskState::Success]
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn unregistered_task_fails_without_handler_invocation() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register(
            "known",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::done())
                }
            }),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker.clone(), store).await;

    let task_id = runtime
        .publish(TaskMessage::new("ghost_task"))
        .await
        .unwrap();

    let store_dyn = runtime.store();
    let result = wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Failure,
        Duration::from_secs(5),
    )
    .await;

    let failure = result.error.unwrap();
    assert_eq!(failure.kind, "unknown_task");
    assert!(!failure.retryable);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // The delivery is dead-lettered, not silently dropped.
    let dead = broker.dead_letters("default").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_name, "ghost_task");

    runtime.shutdown().await;
}

#[tokio::test]
async fn retry_budget_is_exactly_enforced() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register_with(
            "always_fails",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<HandlerOutcome, _>(HandlerError::retryable("flaky dependency"))
                }
            }),
            fast_retry(3),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker.clone(), store).await;

    let task_id = runtime
        .publish(TaskMessage::new("always_fails"))
        .await
        .unwrap();

    let store_dyn = runtime.store();
    let result = wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Failure,
        Duration::from_secs(10),
    )
    .await;

    // One original delivery plus exactly three retries, never a fourth.
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(result.retry_count, 3);
    assert_eq!(result.error.unwrap().kind, "handler_failed");

    let dead = broker.dead_letters("default").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 3);

    runtime.shutdown().await;
}

#[tokio::test]
async fn fatal_handler_error_skips_retries() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register_with(
            "bad_input",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<HandlerOutcome, _>(HandlerError::fatal("malformed record"))
                }
            }),
            fast_retry(5),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker.clone(), store).await;

    let task_id = runtime.publish(TaskMessage::new("bad_input")).await.unwrap();

    let store_dyn = runtime.store();
    wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Failure,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(broker.dead_letters("default").await.len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn redelivery_after_success_is_idempotent() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register(
            "once",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::Complete(json!("first")))
                }
            }),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker.clone(), store).await;

    let message = TaskMessage::new("once");
    let duplicate = message.clone();
    let task_id = runtime.publish(message).await.unwrap();

    let store_dyn = runtime.store();
    let first = wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Success,
        Duration::from_secs(5),
    )
    .await;

    // Simulate the broker redelivering the same envelope.
    runtime.publish(duplicate).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = store_dyn.get_result(task_id).await.unwrap().unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(after, first);
    assert_eq!(broker.queue_length("default").await, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn revoked_task_short_circuits() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register(
            "cancellable",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::done())
                }
            }),
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker.clone(), store).await;

    // Observe the lineage, revoke it, then let the delivery arrive.
    let message = TaskMessage::new("cancellable");
    let task_id = message.task_id;
    let store_dyn = runtime.store();
    store_dyn.ensure_result(task_id, "cancellable").await.unwrap();
    assert!(runtime.revoke(task_id).await.unwrap());

    runtime.publish(message).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let result = store_dyn.get_result(task_id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Revoked);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(broker.queue_length("default").await, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn handler_timeout_is_retryable() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let registry = TaskRegistry::builder("default")
        .register_with(
            "slow",
            handler_fn(move |_ctx, _args, _kwargs| {
                let counter = counter.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok(HandlerOutcome::Complete(json!("recovered")))
                }
            }),
            TaskOptions {
                retry_policy: RetryPolicy::new(
                    2,
                    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(20)),
                ),
                timeout: Duration::from_millis(100),
                queue: None,
            },
        )
        .unwrap()
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut runtime = start_runtime(registry, broker, store).await;

    let task_id = runtime.publish(TaskMessage::new("slow")).await.unwrap();

    let store_dyn = runtime.store();
    let result = wait_for_state(
        &store_dyn,
        task_id,
        TaskState::Success,
        Duration::from_secs(10),
    )
    .await;

    // First attempt timed out, the retry completed.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(result.result, Some(json!("recovered")));

    runtime.shutdown().await;
}
