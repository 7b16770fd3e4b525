//! The Task entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// Whether a task runs without interactive confirmation or pauses for
/// user input at defined points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    Autonomous,
    Interactive,
}

/// Task priority, used both for store ordering and scheduler tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "normal" => Some(TaskPriority::Normal),
            "high" => Some(TaskPriority::High),
            "urgent" => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

/// Status of a task, per the state machine in §3 of the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses this status may transition into directly.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Cancelled],
            TaskStatus::Running => &[
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Paused => &[TaskStatus::Running, TaskStatus::Cancelled],
            TaskStatus::Failed => &[TaskStatus::Pending],
            TaskStatus::Completed | TaskStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Why a task is paused. The first three are auto-resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Capacity,
    Budget,
    UsageLimit,
    Manual,
    UserRequest,
    Error,
    Dependency,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Capacity => "capacity",
            PauseReason::Budget => "budget",
            PauseReason::UsageLimit => "usage_limit",
            PauseReason::Manual => "manual",
            PauseReason::UserRequest => "user_request",
            PauseReason::Error => "error",
            PauseReason::Dependency => "dependency",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "capacity" => Some(PauseReason::Capacity),
            "budget" => Some(PauseReason::Budget),
            "usage_limit" => Some(PauseReason::UsageLimit),
            "manual" => Some(PauseReason::Manual),
            "user_request" => Some(PauseReason::UserRequest),
            "error" => Some(PauseReason::Error),
            "dependency" => Some(PauseReason::Dependency),
            _ => None,
        }
    }

    /// The first three pause reasons are eligible for auto-resume on
    /// `capacity:restored`; the rest require explicit user action.
    pub fn is_auto_resumable(&self) -> bool {
        matches!(
            self,
            PauseReason::Capacity | PauseReason::Budget | PauseReason::UsageLimit
        )
    }
}

/// Cumulative token/cost usage for a task. Monotonically non-decreasing
/// while the task is not cancelled (invariant 3 in §8).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Estimated cost, fixed-point with 4 fractional digits (i.e. value is
    /// in ten-thousandths of the configured currency unit).
    pub estimated_cost_e4: i64,
}

impl Usage {
    pub fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            estimated_cost_e4: 0,
        }
    }

    /// Add a delta, returning the new rolled-up usage. Never decreases.
    pub fn add(&self, delta: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + delta.input_tokens,
            output_tokens: self.output_tokens + delta.output_tokens,
            total_tokens: self.total_tokens + delta.total_tokens,
            estimated_cost_e4: self.estimated_cost_e4 + delta.estimated_cost_e4,
        }
    }
}

/// A unit of work owned exclusively by the Task Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub acceptance_criteria: String,
    pub workflow_name: String,
    pub autonomy: Autonomy,
    pub priority: TaskPriority,
    pub project_path: String,
    pub branch_name: Option<String>,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,

    pub usage: Usage,

    pub current_stage: Option<String>,
    pub current_agent: Option<String>,

    pub pause_reason: Option<PauseReason>,
    pub resume_after: Option<DateTime<Utc>>,

    /// Bumped on every transition; optimistic-locking token for the Store.
    pub version: u64,
}

impl Task {
    /// Construct a new task in `pending`, stamping both timestamps to `now`.
    pub fn new(
        description: String,
        acceptance_criteria: String,
        workflow_name: String,
        autonomy: Autonomy,
        priority: TaskPriority,
        project_path: String,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            acceptance_criteria,
            workflow_name,
            autonomy,
            priority,
            project_path,
            branch_name: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            paused_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            usage: Usage::zero(),
            current_stage: None,
            current_agent: None,
            pause_reason: None,
            resume_after: None,
            version: 0,
        }
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.description.trim().is_empty() {
            return Err(OrchestratorError::ValidationError(
                "description must not be empty".into(),
            ));
        }
        if self.workflow_name.trim().is_empty() {
            return Err(OrchestratorError::ValidationError(
                "workflow_name must not be empty".into(),
            ));
        }
        if self.project_path.trim().is_empty() {
            return Err(OrchestratorError::ValidationError(
                "project_path must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Validated transition: checks the state machine and the
    /// paused-at/pause-reason invariants, bumps `updated_at`/`version`.
    pub fn transition_to(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if self.status.is_terminal() {
            return Err(OrchestratorError::IllegalTransition {
                task_id: self.id,
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::IllegalTransition {
                task_id: self.id,
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.apply_transition(next, now);
        Ok(())
    }

    /// Bypasses the state machine check. Used only for crash-recovery
    /// reconciliation and test setup; logs a warning.
    pub fn force_status(&mut self, next: TaskStatus, now: DateTime<Utc>) {
        tracing::warn!(
            task_id = %self.id,
            from = self.status.as_str(),
            to = next.as_str(),
            "forcing task status outside the validated state machine"
        );
        self.apply_transition(next, now);
    }

    fn apply_transition(&mut self, next: TaskStatus, now: DateTime<Utc>) {
        if next == TaskStatus::Paused {
            self.paused_at = Some(now);
        } else if self.status == TaskStatus::Paused {
            self.paused_at = None;
            self.pause_reason = None;
            self.resume_after = None;
        }
        if matches!(
            next,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        self.version += 1;
    }

    /// Pause with a reason, stamping `pausedAt` and gating `resumeAfter`.
    pub fn pause(
        &mut self,
        reason: PauseReason,
        resume_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        self.transition_to(TaskStatus::Paused, now)?;
        self.pause_reason = Some(reason);
        self.resume_after = resume_after;
        Ok(())
    }

    /// Apply a usage delta, keeping the rollup monotonically non-decreasing.
    pub fn apply_usage_delta(&mut self, delta: &Usage, now: DateTime<Utc>) {
        self.usage = self.usage.add(delta);
        self.updated_at = now;
    }

    /// True iff `retryCount < maxRetries`, i.e. another retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_task() -> Task {
        Task::new(
            "do the thing".into(),
            "it is done".into(),
            "code".into(),
            Autonomy::Autonomous,
            TaskPriority::Normal,
            "/tmp/project".into(),
            3,
            now(),
        )
    }

    #[test]
    fn new_task_starts_pending_with_zero_usage() {
        let t = sample_task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.usage.total_tokens, 0);
        assert_eq!(t.version, 0);
    }

    #[test]
    fn pending_to_running_is_valid() {
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.version, 1);
    }

    #[test]
    fn pending_to_completed_is_rejected() {
        let mut t = sample_task();
        let err = t.transition_to(TaskStatus::Completed, now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn pause_sets_paused_at_and_reason_together() {
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.pause(PauseReason::Capacity, None, now()).unwrap();
        assert_eq!(t.status, TaskStatus::Paused);
        assert!(t.paused_at.is_some());
        assert_eq!(t.pause_reason, Some(PauseReason::Capacity));
    }

    #[test]
    fn resume_clears_pause_fields() {
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.pause(PauseReason::Capacity, None, now()).unwrap();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        assert!(t.paused_at.is_none());
        assert!(t.pause_reason.is_none());
    }

    #[test]
    fn terminal_statuses_reject_further_transitions() {
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.transition_to(TaskStatus::Completed, now()).unwrap();
        let err = t.transition_to(TaskStatus::Failed, now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
    }

    #[test]
    fn failed_retries_back_to_pending() {
        let mut t = sample_task();
        t.transition_to(TaskStatus::Running, now()).unwrap();
        t.transition_to(TaskStatus::Failed, now()).unwrap();
        t.transition_to(TaskStatus::Pending, now()).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut t = sample_task();
        t.apply_usage_delta(
            &Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                estimated_cost_e4: 100,
            },
            now(),
        );
        t.apply_usage_delta(
            &Usage {
                input_tokens: 1,
                output_tokens: 1,
                total_tokens: 2,
                estimated_cost_e4: 5,
            },
            now(),
        );
        assert_eq!(t.usage.total_tokens, 17);
        assert_eq!(t.usage.estimated_cost_e4, 105);
    }

    #[test]
    fn can_retry_respects_max_retries() {
        let mut t = sample_task();
        t.max_retries = 1;
        assert!(t.can_retry());
        t.retry_count = 1;
        assert!(!t.can_retry());
    }
}
