//! The agent runtime interface the core consumes. Per §1, the runtime
//! itself is out of scope; only this port and a test double are shipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::models::{Stage, Task, TaskStatus, Usage};

/// Cooperative cancellation token; honoured by the runtime at its own
/// suspension points rather than forcibly interrupting it.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(AtomicBool, Notify)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.0.store(true, Ordering::SeqCst);
        self.inner.1.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.0.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.1.notified().await;
    }
}

/// What the core hands the runtime for a single stage dispatch.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task: Task,
    pub stage: Stage,
    pub input: String,
    pub cancel: CancelToken,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One event in the stream a stage dispatch produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    Thinking { summary: String },
    Message { text: String },
    ToolUse { tool: String },
    UsageDelta { usage: Usage },
    /// The agent split off a child work item. `subtask_id` is assigned by
    /// the runtime so a later `SubtaskCompleted` can reference the same
    /// subtask without round-tripping through the store first.
    SubtaskCreated { subtask_id: Uuid, description: String },
    SubtaskCompleted { subtask_id: Uuid, status: TaskStatus },
    /// The agent moved from one named stage of its own internal process
    /// to another, distinct from the orchestrator's workflow stages.
    AgentTransition { from: String, to: String },
    Result { summary: String },
    Error { message: String, transient: bool },
}

/// Port the Scheduler dispatches stages through.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Dispatch one stage, returning a handle whose events are pulled
    /// via `next_event`. A runtime implementation may run the agent on
    /// its own task/thread and bridge results through an internal channel.
    async fn dispatch(&self, ctx: StageContext) -> Box<dyn AgentStageHandle>;
}

/// Handle to an in-flight stage dispatch.
#[async_trait]
pub trait AgentStageHandle: Send {
    /// Pull the next event, or `None` once the stream is exhausted
    /// (after the terminal `Result`/`Error` event).
    async fn next_event(&mut self) -> Option<AgentEvent>;

    fn task_id(&self) -> Uuid;
}
