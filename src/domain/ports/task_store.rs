//! Task Store port: durable, transactional storage for Tasks and Subtasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::{ActiveSession, PauseReason, Subtask, Task, TaskPriority, TaskStatus, Usage};

/// Filter criteria for `listTasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub priorities: Option<Vec<TaskPriority>>,
    pub pause_reasons: Option<Vec<PauseReason>>,
    /// Only return tasks whose `resumeAfter` is unset or `<= now`.
    pub resume_after_before: Option<DateTime<Utc>>,
}

/// Durable storage for Tasks and Subtasks. All mutations are serialised
/// through a single writer; readers are non-blocking.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Assigns an id, stamps timestamps, persists with status `pending`.
    async fn create_task(&self, task: Task) -> OrchestratorResult<Uuid>;

    async fn get_task(&self, id: Uuid) -> OrchestratorResult<Option<Task>>;

    /// Replace the persisted task, bumping `updatedAt`. The caller is
    /// responsible for having validated the state transition already
    /// (`Task::transition_to`); the store enforces optimistic locking on
    /// `version` and returns `StoreUnavailable` on conflict.
    async fn update_task(&self, task: &Task) -> OrchestratorResult<()>;

    async fn list_tasks(&self, filter: TaskFilter) -> OrchestratorResult<Vec<Task>>;

    /// Paused tasks eligible for auto-resume: `pauseReason` is
    /// auto-resumable and `resumeAfter` is unset or due, ordered by
    /// `(priority desc, createdAt asc)` with a total tie-break on id.
    async fn get_paused_tasks_for_resume(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Task>>;

    /// Atomically claim a `pending` task for dispatch: transitions it to
    /// `running` iff it is still `pending`, returning `None` if another
    /// writer already claimed it.
    async fn claim_pending_task(&self, id: Uuid, now: DateTime<Utc>) -> OrchestratorResult<Option<Task>>;

    async fn create_subtask(&self, subtask: Subtask) -> OrchestratorResult<Uuid>;

    async fn list_subtasks(&self, parent_task_id: Uuid) -> OrchestratorResult<Vec<Subtask>>;

    async fn update_subtask_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()>;

    /// Apply a usage delta to a task's rollup under the same
    /// transactional boundary as the read, so concurrent usage updates
    /// never interleave lost writes.
    async fn apply_usage_delta(&self, id: Uuid, delta: Usage, now: DateTime<Utc>) -> OrchestratorResult<()>;

    /// Releases the backing connection. Idempotent.
    async fn close(&self) -> OrchestratorResult<()>;

    /// Marks `session_id` as the active session, replacing whatever
    /// pointer was previously recorded. Called once at daemon startup.
    async fn start_session(&self, session_id: Uuid, now: DateTime<Utc>) -> OrchestratorResult<()>;

    /// The most recently recorded active session, if the daemon has
    /// started at least once against this database.
    async fn get_active_session(&self) -> OrchestratorResult<Option<ActiveSession>>;
}
