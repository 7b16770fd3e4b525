//! Event taxonomy for the orchestrator event bus.
//!
//! Grounded in the teacher's `UnifiedEvent` envelope (monotonic sequence
//! number plus a tagged payload), trimmed to the canonical event names
//! named in §6 of the spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::PauseReason;
use crate::domain::models::capacity::RestoreReason;

/// The envelope every bus event is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// One variant per canonical event name in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "task:started")]
    TaskStarted { task_id: Uuid },

    #[serde(rename = "task:stage-changed")]
    TaskStageChanged {
        task_id: Uuid,
        stage: String,
        agent: String,
    },

    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: Uuid },

    #[serde(rename = "task:failed")]
    TaskFailed { task_id: Uuid, reason: String },

    #[serde(rename = "task:cancelled")]
    TaskCancelled { task_id: Uuid },

    #[serde(rename = "task:paused")]
    TaskPaused {
        task_id: Uuid,
        reason: PauseReason,
        resume_after: Option<DateTime<Utc>>,
    },

    #[serde(rename = "task:resumed")]
    TaskResumed { task_id: Uuid },

    #[serde(rename = "subtask:created")]
    SubtaskCreated { task_id: Uuid, subtask_id: Uuid },

    #[serde(rename = "subtask:completed")]
    SubtaskCompleted { task_id: Uuid, subtask_id: Uuid },

    #[serde(rename = "agent:transition")]
    AgentTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[serde(rename = "agent:message")]
    AgentMessage { task_id: Uuid, message: String },

    #[serde(rename = "agent:tool-use")]
    AgentToolUse { task_id: Uuid, tool: String },

    #[serde(rename = "agent:thinking")]
    AgentThinking { task_id: Uuid, summary: String },

    #[serde(rename = "stage:parallel-started")]
    StageParallelStarted { task_id: Uuid, group: String },

    #[serde(rename = "stage:parallel-completed")]
    StageParallelCompleted { task_id: Uuid, group: String },

    #[serde(rename = "usage:updated")]
    UsageUpdated {
        task_id: Uuid,
        total_tokens: u64,
        estimated_cost_e4: i64,
    },

    #[serde(rename = "capacity:restored")]
    CapacityRestored { reason: RestoreReason },

    #[serde(rename = "tasks:auto-resumed")]
    TasksAutoResumed {
        reason: RestoreReason,
        resumed_count: u32,
        errors: Vec<Uuid>,
    },

    /// A subscriber fell behind the broadcast channel's capacity and the
    /// oldest events were dropped to make room. Bus-wide, not tied to a
    /// task. `dropped_events` is the running total, not just this delta.
    #[serde(rename = "bus:backlog-dropped")]
    BusBacklogDropped { dropped_events: u64 },
}

impl EventPayload {
    /// Stable event name, matching the canonical names in §6.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::TaskStarted { .. } => "task:started",
            EventPayload::TaskStageChanged { .. } => "task:stage-changed",
            EventPayload::TaskCompleted { .. } => "task:completed",
            EventPayload::TaskFailed { .. } => "task:failed",
            EventPayload::TaskCancelled { .. } => "task:cancelled",
            EventPayload::TaskPaused { .. } => "task:paused",
            EventPayload::TaskResumed { .. } => "task:resumed",
            EventPayload::SubtaskCreated { .. } => "subtask:created",
            EventPayload::SubtaskCompleted { .. } => "subtask:completed",
            EventPayload::AgentTransition { .. } => "agent:transition",
            EventPayload::AgentMessage { .. } => "agent:message",
            EventPayload::AgentToolUse { .. } => "agent:tool-use",
            EventPayload::AgentThinking { .. } => "agent:thinking",
            EventPayload::StageParallelStarted { .. } => "stage:parallel-started",
            EventPayload::StageParallelCompleted { .. } => "stage:parallel-completed",
            EventPayload::UsageUpdated { .. } => "usage:updated",
            EventPayload::CapacityRestored { .. } => "capacity:restored",
            EventPayload::TasksAutoResumed { .. } => "tasks:auto-resumed",
            EventPayload::BusBacklogDropped { .. } => "bus:backlog-dropped",
        }
    }

    /// The task this event concerns, where applicable.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            EventPayload::TaskStarted { task_id }
            | EventPayload::TaskStageChanged { task_id, .. }
            | EventPayload::TaskCompleted { task_id }
            | EventPayload::TaskFailed { task_id, .. }
            | EventPayload::TaskCancelled { task_id }
            | EventPayload::TaskPaused { task_id, .. }
            | EventPayload::TaskResumed { task_id }
            | EventPayload::SubtaskCreated { task_id, .. }
            | EventPayload::SubtaskCompleted { task_id, .. }
            | EventPayload::AgentTransition { task_id, .. }
            | EventPayload::AgentMessage { task_id, .. }
            | EventPayload::AgentToolUse { task_id, .. }
            | EventPayload::AgentThinking { task_id, .. }
            | EventPayload::StageParallelStarted { task_id, .. }
            | EventPayload::StageParallelCompleted { task_id, .. }
            | EventPayload::UsageUpdated { task_id, .. } => Some(*task_id),
            EventPayload::CapacityRestored { .. }
            | EventPayload::TasksAutoResumed { .. }
            | EventPayload::BusBacklogDropped { .. } => None,
        }
    }
}
