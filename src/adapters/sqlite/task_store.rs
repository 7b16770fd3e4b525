//! SQLite implementation of the `TaskStore` port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{ActiveSession, Autonomy, PauseReason, Subtask, Task, TaskPriority, TaskStatus, Usage};
use crate::domain::ports::task_store::{TaskFilter, TaskStore};

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    description: String,
    acceptance_criteria: String,
    workflow_name: String,
    autonomy: String,
    priority: String,
    project_path: String,
    branch_name: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
    paused_at: Option<String>,
    completed_at: Option<String>,
    retry_count: i64,
    max_retries: i64,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    estimated_cost_e4: i64,
    current_stage: Option<String>,
    current_agent: Option<String>,
    pause_reason: Option<String>,
    resume_after: Option<String>,
    version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = OrchestratorError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: parse_uuid(&row.id)?,
            description: row.description,
            acceptance_criteria: row.acceptance_criteria,
            workflow_name: row.workflow_name,
            autonomy: match row.autonomy.as_str() {
                "autonomous" => Autonomy::Autonomous,
                "interactive" => Autonomy::Interactive,
                other => {
                    return Err(OrchestratorError::Serialization(format!(
                        "unknown autonomy value: {other}"
                    )))
                }
            },
            priority: TaskPriority::from_str(&row.priority).ok_or_else(|| {
                OrchestratorError::Serialization(format!("unknown priority value: {}", row.priority))
            })?,
            project_path: row.project_path,
            branch_name: row.branch_name,
            status: TaskStatus::from_str(&row.status).ok_or_else(|| {
                OrchestratorError::Serialization(format!("unknown status value: {}", row.status))
            })?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            paused_at: parse_optional_datetime(row.paused_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            usage: Usage {
                input_tokens: row.input_tokens as u64,
                output_tokens: row.output_tokens as u64,
                total_tokens: row.total_tokens as u64,
                estimated_cost_e4: row.estimated_cost_e4,
            },
            current_stage: row.current_stage,
            current_agent: row.current_agent,
            pause_reason: row
                .pause_reason
                .as_deref()
                .map(|s| {
                    PauseReason::from_str(s).ok_or_else(|| {
                        OrchestratorError::Serialization(format!("unknown pause reason: {s}"))
                    })
                })
                .transpose()?,
            resume_after: parse_optional_datetime(row.resume_after)?,
            version: row.version as u64,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubtaskRow {
    id: String,
    parent_task_id: String,
    description: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SubtaskRow> for Subtask {
    type Error = OrchestratorError;

    fn try_from(row: SubtaskRow) -> Result<Self, Self::Error> {
        Ok(Subtask {
            id: parse_uuid(&row.id)?,
            parent_task_id: parse_uuid(&row.parent_task_id)?,
            description: row.description,
            status: TaskStatus::from_str(&row.status).ok_or_else(|| {
                OrchestratorError::Serialization(format!("unknown status value: {}", row.status))
            })?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: Task) -> OrchestratorResult<Uuid> {
        task.validate()?;
        sqlx::query(
            "INSERT INTO tasks (
                id, description, acceptance_criteria, workflow_name, autonomy, priority,
                project_path, branch_name, status, created_at, updated_at, paused_at,
                completed_at, retry_count, max_retries, input_tokens, output_tokens,
                total_tokens, estimated_cost_e4, current_stage, current_agent,
                pause_reason, resume_after, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(&task.description)
        .bind(&task.acceptance_criteria)
        .bind(&task.workflow_name)
        .bind(if task.autonomy == Autonomy::Autonomous { "autonomous" } else { "interactive" })
        .bind(task.priority.as_str())
        .bind(&task.project_path)
        .bind(&task.branch_name)
        .bind(task.status.as_str())
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.paused_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(task.usage.input_tokens as i64)
        .bind(task.usage.output_tokens as i64)
        .bind(task.usage.total_tokens as i64)
        .bind(task.usage.estimated_cost_e4)
        .bind(&task.current_stage)
        .bind(&task.current_agent)
        .bind(task.pause_reason.map(|r| r.as_str()))
        .bind(task.resume_after.map(|t| t.to_rfc3339()))
        .bind(task.version as i64)
        .execute(&self.pool)
        .await?;

        Ok(task.id)
    }

    async fn get_task(&self, id: Uuid) -> OrchestratorResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn update_task(&self, task: &Task) -> OrchestratorResult<()> {
        // Optimistic lock: the in-memory transition already bumped
        // `version`, so the previously-persisted version is `version - 1`.
        let previous_version = task.version.saturating_sub(1) as i64;

        let result = sqlx::query(
            "UPDATE tasks SET
                status = ?, updated_at = ?, paused_at = ?, completed_at = ?,
                retry_count = ?, max_retries = ?, input_tokens = ?, output_tokens = ?,
                total_tokens = ?, estimated_cost_e4 = ?, current_stage = ?,
                current_agent = ?, pause_reason = ?, resume_after = ?, branch_name = ?,
                version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(task.status.as_str())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.paused_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(task.usage.input_tokens as i64)
        .bind(task.usage.output_tokens as i64)
        .bind(task.usage.total_tokens as i64)
        .bind(task.usage.estimated_cost_e4)
        .bind(&task.current_stage)
        .bind(&task.current_agent)
        .bind(task.pause_reason.map(|r| r.as_str()))
        .bind(task.resume_after.map(|t| t.to_rfc3339()))
        .bind(&task.branch_name)
        .bind(task.version as i64)
        .bind(task.id.to_string())
        .bind(previous_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::StoreUnavailable(format!(
                "concurrent modification of task {} (expected version {})",
                task.id, previous_version
            )));
        }
        Ok(())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> OrchestratorResult<Vec<Task>> {
        // The filter set is small and combinatorial filtering in SQL adds
        // little here; fetch everything and filter in memory, mirroring
        // the predicate-based `listTasks` contract directly.
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<OrchestratorResult<Vec<_>>>()?;

        if let Some(statuses) = &filter.statuses {
            tasks.retain(|t| statuses.contains(&t.status));
        }
        if let Some(priorities) = &filter.priorities {
            tasks.retain(|t| priorities.contains(&t.priority));
        }
        if let Some(reasons) = &filter.pause_reasons {
            tasks.retain(|t| t.pause_reason.is_some_and(|r| reasons.contains(&r)));
        }
        if let Some(before) = filter.resume_after_before {
            tasks.retain(|t| t.resume_after.is_none_or(|ra| ra <= before));
        }

        Ok(tasks)
    }

    async fn get_paused_tasks_for_resume(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE status = 'paused'
             AND pause_reason IN ('capacity', 'budget', 'usage_limit')
             AND (resume_after IS NULL OR resume_after <= ?)",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<OrchestratorResult<Vec<_>>>()?;

        // (priority desc, createdAt asc), total tie-break on id.
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(tasks)
    }

    async fn claim_pending_task(&self, id: Uuid, now: DateTime<Utc>) -> OrchestratorResult<Option<Task>> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', updated_at = ?, version = version + 1
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_task(id).await
    }

    async fn create_subtask(&self, subtask: Subtask) -> OrchestratorResult<Uuid> {
        sqlx::query(
            "INSERT INTO subtasks (id, parent_task_id, description, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(subtask.id.to_string())
        .bind(subtask.parent_task_id.to_string())
        .bind(&subtask.description)
        .bind(subtask.status.as_str())
        .bind(subtask.created_at.to_rfc3339())
        .bind(subtask.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(subtask.id)
    }

    async fn list_subtasks(&self, parent_task_id: Uuid) -> OrchestratorResult<Vec<Subtask>> {
        let rows: Vec<SubtaskRow> =
            sqlx::query_as("SELECT * FROM subtasks WHERE parent_task_id = ? ORDER BY created_at ASC")
                .bind(parent_task_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Subtask::try_from).collect()
    }

    async fn update_subtask_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        sqlx::query("UPDATE subtasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_usage_delta(&self, id: Uuid, delta: Usage, now: DateTime<Utc>) -> OrchestratorResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET
                input_tokens = input_tokens + ?,
                output_tokens = output_tokens + ?,
                total_tokens = total_tokens + ?,
                estimated_cost_e4 = estimated_cost_e4 + ?,
                updated_at = ?
             WHERE id = ? AND status != 'cancelled'",
        )
        .bind(delta.input_tokens as i64)
        .bind(delta.output_tokens as i64)
        .bind(delta.total_tokens as i64)
        .bind(delta.estimated_cost_e4)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn start_session(&self, session_id: Uuid, now: DateTime<Utc>) -> OrchestratorResult<()> {
        sqlx::query("INSERT OR REPLACE INTO active_session (id, session_id, started_at) VALUES (1, ?, ?)")
            .bind(session_id.to_string())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_active_session(&self) -> OrchestratorResult<Option<ActiveSession>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT session_id, started_at FROM active_session WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(session_id, started_at)| {
            Ok(ActiveSession {
                session_id: parse_uuid(&session_id)?,
                started_at: parse_datetime(&started_at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use chrono::Duration;

    async fn store() -> SqliteTaskStore {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskStore::new(pool)
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn sample_task() -> Task {
        Task::new(
            "write the docs".into(),
            "docs published".into(),
            "docs".into(),
            Autonomy::Autonomous,
            TaskPriority::Normal,
            "/tmp/p".into(),
            3,
            now(),
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = store().await;
        let task = sample_task();
        let id = store.create_task(task.clone()).await.unwrap();
        let fetched = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claim_pending_task_is_race_safe() {
        let store = store().await;
        let task = sample_task();
        let id = store.create_task(task).await.unwrap();

        let claimed = store.claim_pending_task(id, now()).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().status, TaskStatus::Running);

        // Second claim on the now-running task must see no rows affected.
        let second = store.claim_pending_task(id, now()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn update_task_rejects_stale_version() {
        let store = store().await;
        let mut task = sample_task();
        store.create_task(task.clone()).await.unwrap();

        task.transition_to(TaskStatus::Running, now()).unwrap();
        store.update_task(&task).await.unwrap();

        // A second writer still holding the pre-transition copy tries to
        // apply its own (now stale) transition.
        let mut stale = task.clone();
        stale.version -= 1;
        stale.transition_to(TaskStatus::Paused, now()).unwrap();
        let err = store.update_task(&stale).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn get_paused_tasks_for_resume_orders_by_priority_then_created_at() {
        let store = store().await;
        let mut urgent = sample_task();
        urgent.priority = TaskPriority::Urgent;
        urgent.created_at = now();
        let mut normal = sample_task();
        normal.priority = TaskPriority::Normal;
        normal.created_at = now() + Duration::seconds(1);

        for t in [&mut urgent, &mut normal] {
            t.transition_to(TaskStatus::Running, now()).unwrap();
            t.pause(PauseReason::Capacity, None, now()).unwrap();
        }
        store.create_task(urgent.clone()).await.unwrap();
        store.create_task(normal.clone()).await.unwrap();

        let resumable = store.get_paused_tasks_for_resume(now()).await.unwrap();
        assert_eq!(resumable.len(), 2);
        assert_eq!(resumable[0].id, urgent.id);
        assert_eq!(resumable[1].id, normal.id);
    }

    #[tokio::test]
    async fn resume_after_gate_excludes_future_tasks() {
        let store = store().await;
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.pause(PauseReason::Capacity, Some(now() + Duration::hours(24)), now())
            .unwrap();
        store.create_task(t).await.unwrap();

        let resumable = store.get_paused_tasks_for_resume(now()).await.unwrap();
        assert!(resumable.is_empty());
    }

    #[tokio::test]
    async fn non_resumable_pause_reasons_are_excluded() {
        let store = store().await;
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.pause(PauseReason::Manual, None, now()).unwrap();
        store.create_task(t).await.unwrap();

        let resumable = store.get_paused_tasks_for_resume(now()).await.unwrap();
        assert!(resumable.is_empty());
    }

    #[tokio::test]
    async fn usage_delta_accumulates_in_storage() {
        let store = store().await;
        let task = sample_task();
        let id = store.create_task(task).await.unwrap();

        store
            .apply_usage_delta(
                id,
                Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                    estimated_cost_e4: 42,
                },
                now(),
            )
            .await
            .unwrap();

        let fetched = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(fetched.usage.total_tokens, 15);
        assert_eq!(fetched.usage.estimated_cost_e4, 42);
    }

    #[tokio::test]
    async fn starting_a_session_overwrites_the_previous_pointer() {
        let store = store().await;
        assert!(store.get_active_session().await.unwrap().is_none());

        let first = Uuid::new_v4();
        store.start_session(first, now()).await.unwrap();
        assert_eq!(store.get_active_session().await.unwrap().unwrap().session_id, first);

        let second = Uuid::new_v4();
        store.start_session(second, now()).await.unwrap();
        let active = store.get_active_session().await.unwrap().unwrap();
        assert_eq!(active.session_id, second);
    }
}
