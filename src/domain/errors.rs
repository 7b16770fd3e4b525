//! Error taxonomy for the orchestrator core.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the domain and service layers.
///
/// One variant per kind named in the error-handling design: callers that
/// need to react differently to `CapacityDenied` vs. a hard failure match
/// on the variant rather than parsing a message.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Not surfaced to external callers; the Scheduler consumes this to
    /// decide how to pause a task.
    #[error("capacity denied: {0}")]
    CapacityDenied(String),

    #[error("agent transient error: {0}")]
    AgentTransient(String),

    #[error("agent fatal error: {0}")]
    AgentFatal(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("shutdown exceeded drain deadline")]
    ShutdownExceeded,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}
