//! # Orchestration
//!
//! External job orchestration: the consumed backend interface, the
//! submit-and-poll orchestrator, and the reconciliation loop that survives
//! restarts.

pub mod backend;
pub mod orchestrator;
pub mod reconciler;

pub use backend::{BackendError, BackendResult, JobSpec, PipelineBackend};
pub use orchestrator::{JobOrchestrator, JobOutcome, OrchestratorConfig};
pub use reconciler::{Reconciler, ReconcilerConfig};
