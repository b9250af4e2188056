//! Worker process entry point: load configuration, register tasks, run the
//! pool (plus beat and reconciler when enabled) until interrupted.

use std::sync::Arc;

use anyhow::Context;
use taskmanager_core::config::WorkerConfig;
use taskmanager_core::logging::init_logging;
use taskmanager_core::registry::{handler_fn, HandlerOutcome, TaskRegistry};
use taskmanager_core::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => WorkerConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => WorkerConfig::from_env().context("loading configuration from environment")?,
    };

    // Deployments register their task set here; the built-in no-op keeps a
    // bare process useful for smoke-testing queue plumbing.
    let registry = Arc::new(
        TaskRegistry::builder(config.default_queue.clone())
            .register(
                "ping",
                handler_fn(|_ctx, _args, _kwargs| async move {
                    Ok(HandlerOutcome::Complete(serde_json::json!("pong")))
                }),
            )
            .context("registering tasks")?
            .build(),
    );

    let mut runtime = WorkerRuntime::builder(config, registry)
        .build()
        .await
        .context("assembling worker runtime")?;
    runtime.start().await.context("starting worker runtime")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    runtime.shutdown().await;

    Ok(())
}
