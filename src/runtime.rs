//! # Worker Runtime
//!
//! Wires the components together per the configuration: broker client,
//! state store, dispatcher, worker pool, optional beat scheduler, and the
//! job reconciler. Every component receives its collaborators at
//! construction; there are no process-wide singletons.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::messaging::{Broker, InMemoryBroker, RabbitBroker, TaskMessage};
use crate::orchestration::{JobOrchestrator, PipelineBackend, Reconciler, ReconcilerConfig};
use crate::registry::TaskRegistry;
use crate::scheduler::Beat;
use crate::store::{InMemoryStateStore, PostgresStateStore, StateStore, TaskResult};
use crate::worker::{Dispatcher, WorkerPool};

/// Builder for a worker process.
pub struct WorkerRuntimeBuilder {
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn StateStore>>,
    backend: Option<Arc<dyn PipelineBackend>>,
}

impl WorkerRuntimeBuilder {
    pub fn new(config: WorkerConfig, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            registry,
            broker: None,
            store: None,
            backend: None,
        }
    }

    /// Inject a broker instead of building one from the config.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Inject a state store instead of building one from the config.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the external pipeline backend; enables the job orchestrator
    /// and reconciler.
    pub fn with_backend(mut self, backend: Arc<dyn PipelineBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Resolve collaborators from the config and assemble the runtime.
    pub async fn build(self) -> Result<WorkerRuntime> {
        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None if self.config.uses_memory_broker() => Arc::new(InMemoryBroker::new()),
            None => Arc::new(
                RabbitBroker::connect(&self.config.broker_uri, self.config.prefetch_count).await?,
            ),
        };

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => match &self.config.database_url {
                Some(url) => Arc::new(PostgresStateStore::connect(url).await?),
                None => Arc::new(InMemoryStateStore::new()),
            },
        };

        let orchestrator = self.backend.map(|backend| {
            Arc::new(JobOrchestrator::new(
                backend,
                store.clone(),
                self.config.orchestrator_config(),
            ))
        });

        Ok(WorkerRuntime {
            config: self.config,
            registry: self.registry,
            broker,
            store,
            orchestrator,
            pool: None,
            slots: None,
            beat: None,
            beat_handle: None,
            reconciler: None,
            reconciler_handle: None,
        })
    }
}

/// An assembled (and possibly running) worker process.
pub struct WorkerRuntime {
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn StateStore>,
    orchestrator: Option<Arc<JobOrchestrator>>,
    pool: Option<Arc<WorkerPool>>,
    slots: Option<JoinSet<()>>,
    beat: Option<Arc<Beat>>,
    beat_handle: Option<JoinHandle<()>>,
    reconciler: Option<Arc<Reconciler>>,
    reconciler_handle: Option<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn builder(config: WorkerConfig, registry: Arc<TaskRegistry>) -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new(config, registry)
    }

    /// Declare queues and spawn the pool, the beat (when enabled), and the
    /// reconciler (when a backend is attached).
    pub async fn start(&mut self) -> Result<()> {
        if self.slots.is_some() {
            return Err(WorkerError::configuration("runtime already started"));
        }

        let mut queues = self.registry.queues();
        queues.extend(self.config.queues.iter().cloned());
        for queue in &queues {
            self.broker.ensure_queue(queue).await?;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.registry.clone(),
            self.broker.clone(),
            self.store.clone(),
            self.config.visibility_timeout(),
        ));
        let pool = Arc::new(WorkerPool::new(dispatcher, self.config.pool_config()));
        self.slots = Some(pool.spawn()?);
        self.pool = Some(pool);

        if self.config.beat_enabled {
            let beat = Arc::new(Beat::new(
                self.broker.clone(),
                self.store.clone(),
                self.config.beat_config()?,
            ));
            self.beat_handle = Some(beat.clone().spawn()?);
            self.beat = Some(beat);
        }

        if let Some(orchestrator) = &self.orchestrator {
            let reconciler = Arc::new(Reconciler::new(
                orchestrator.clone(),
                self.store.clone(),
                ReconcilerConfig {
                    sweep_interval: self.config.reconcile_interval(),
                },
            ));
            self.reconciler_handle = Some(reconciler.clone().spawn()?);
            self.reconciler = Some(reconciler);
        }

        info!(
            concurrency = self.config.concurrency,
            beat = self.config.beat_enabled,
            orchestrator = self.orchestrator.is_some(),
            broker = self.broker.provider_name(),
            "Worker runtime started"
        );
        Ok(())
    }

    /// Signal every loop to stop and wait for in-flight work to drain.
    pub async fn shutdown(&mut self) {
        info!("Worker runtime stopping");
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        if let Some(beat) = &self.beat {
            beat.shutdown();
        }
        if let Some(reconciler) = &self.reconciler {
            reconciler.shutdown();
        }

        if let Some(mut slots) = self.slots.take() {
            while let Some(joined) = slots.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "Worker slot join failed");
                }
            }
        }
        if let Some(handle) = self.beat_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.reconciler_handle.take() {
            let _ = handle.await;
        }
        info!("Worker runtime stopped");
    }

    /// Publish a task to its registered queue. Returns the task_id callers
    /// use to poll the result.
    pub async fn publish(&self, message: TaskMessage) -> Result<Uuid> {
        let queue = self.registry.queue_for(&message.task_name);
        let task_id = message.task_id;
        self.broker.publish(queue, &message).await?;
        Ok(task_id)
    }

    /// Mark a task REVOKED; later deliveries short-circuit. Running handlers
    /// observe revocation cooperatively.
    pub async fn revoke(&self, task_id: Uuid) -> Result<bool> {
        self.store.revoke_result(task_id).await
    }

    /// Look up the recorded result for a lineage.
    pub async fn result(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        self.store.get_result(task_id).await
    }

    pub fn orchestrator(&self) -> Option<Arc<JobOrchestrator>> {
        self.orchestrator.clone()
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }
}
