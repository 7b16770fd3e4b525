//! Subtask entity: a child work item created by an agent mid-task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskStatus;
use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// A subtask shares the Task status set minus the retry policy: a
/// subtask that fails stays failed, it is not requeued to pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub parent_task_id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(parent_task_id: Uuid, description: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_task_id,
            description,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Subtasks never retry, so `failed -> pending` is not permitted here
    /// even though the parent Task's state machine allows it.
    fn valid_transitions(status: TaskStatus) -> &'static [TaskStatus] {
        match status {
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Cancelled],
            TaskStatus::Running => &[
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            _ => &[],
        }
    }

    pub fn transition_to(&mut self, next: TaskStatus, now: DateTime<Utc>) -> OrchestratorResult<()> {
        if !Self::valid_transitions(self.status).contains(&next) {
            return Err(OrchestratorError::IllegalTransition {
                task_id: self.id,
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// A parent task may complete only once every non-cancelled subtask has
/// reached `completed`.
pub fn all_complete_or_cancelled(subtasks: &[Subtask]) -> bool {
    subtasks
        .iter()
        .all(|s| matches!(s.status, TaskStatus::Completed | TaskStatus::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn subtask_cannot_retry_after_failure() {
        let mut s = Subtask::new(Uuid::new_v4(), "child work".into(), now());
        s.transition_to(TaskStatus::Running, now()).unwrap();
        s.transition_to(TaskStatus::Failed, now()).unwrap();
        assert!(s.transition_to(TaskStatus::Pending, now()).is_err());
    }

    #[test]
    fn parent_completion_precondition() {
        let mut a = Subtask::new(Uuid::new_v4(), "a".into(), now());
        let mut b = Subtask::new(Uuid::new_v4(), "b".into(), now());
        assert!(!all_complete_or_cancelled(&[a.clone(), b.clone()]));
        a.transition_to(TaskStatus::Running, now()).unwrap();
        a.transition_to(TaskStatus::Completed, now()).unwrap();
        b.transition_to(TaskStatus::Cancelled, now()).unwrap();
        assert!(all_complete_or_cancelled(&[a, b]));
    }
}
