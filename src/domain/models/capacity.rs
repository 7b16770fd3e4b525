//! Capacity snapshot and mode classification types shared by the
//! Capacity Monitor and the Scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::PauseReason;

/// Time-of-day classification determining which thresholds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Day,
    Night,
    OffHours,
}

/// Current mode, the hours list that defines it, and the next two
/// wall-clock anchors the monitor must wake up at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeInfo {
    pub mode: Mode,
    pub next_mode_switch: DateTime<Utc>,
    pub next_midnight: DateTime<Utc>,
}

/// A point-in-time snapshot of resource consumption, scoped to the
/// currently active mode's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityUsage {
    pub current_tokens: u64,
    pub current_cost_e4: i64,
    pub active_tasks: u32,

    pub tokens_threshold: u64,
    pub cost_threshold_e4: i64,
    pub concurrency_cap: u32,

    pub daily_budget_e4: i64,
    pub daily_spent_e4: i64,
}

impl CapacityUsage {
    /// Whether the current snapshot is within every threshold (all four
    /// axes), i.e. "not over capacity".
    pub fn is_under_all_thresholds(&self) -> bool {
        self.current_tokens <= self.tokens_threshold
            && self.current_cost_e4 <= self.cost_threshold_e4
            && self.daily_spent_e4 <= self.daily_budget_e4
            && self.active_tasks < self.concurrency_cap
    }

    /// The axis that is over, if any, mapped to the pause reason a task
    /// denied on that axis would receive. Checked in a fixed order so
    /// denial reasons are deterministic when multiple axes are over.
    pub fn first_violated_reason(&self, estimated_tokens: u64, estimated_cost_e4: i64) -> Option<PauseReason> {
        if self.active_tasks >= self.concurrency_cap {
            return Some(PauseReason::Capacity);
        }
        if self.current_tokens + estimated_tokens > self.tokens_threshold {
            return Some(PauseReason::UsageLimit);
        }
        if self.current_cost_e4 + estimated_cost_e4 > self.cost_threshold_e4 {
            return Some(PauseReason::Budget);
        }
        if self.daily_spent_e4 + estimated_cost_e4 > self.daily_budget_e4 {
            return Some(PauseReason::Budget);
        }
        None
    }
}

/// Result of `isCapacityAvailable`.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub would_pause_as: Option<PauseReason>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            would_pause_as: None,
        }
    }

    pub fn deny(reason: impl Into<String>, would_pause_as: PauseReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            would_pause_as: Some(would_pause_as),
        }
    }
}

/// Why a `capacity:restored` event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreReason {
    CapacityDropped,
    ModeSwitch,
    BudgetReset,
}

impl RestoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreReason::CapacityDropped => "capacity_dropped",
            RestoreReason::ModeSwitch => "mode_switch",
            RestoreReason::BudgetReset => "budget_reset",
        }
    }
}
