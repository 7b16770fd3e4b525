//! Decides whether new work may start and emits `capacity:restored` when
//! previously-blocked work becomes eligible again.
//!
//! Grounded in the teacher's `budget_tracker.rs`: an `Arc<RwLock<Inner>>`
//! for shared, frequently-read mutable state, and the "emit only on
//! level change" pattern for `capacity:restored`. The single caution/
//! warning/critical percentage ladder is retargeted onto this spec's
//! day/night/off-hours mode axis, and polling is replaced by a single
//! `Clock::sleep_until` deadline per the teacher's own stated preference
//! for timer-driven over polled state (Design Notes).

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::RwLock;

use crate::config::{Limits, ModeThresholds, TimeBasedUsage};
use crate::domain::models::{CapacityUsage, Decision, Mode, ModeInfo, RestoreReason, Usage};
use crate::domain::ports::Clock;
use crate::services::event_bus::EventBus;

struct Inner {
    current_tokens: u64,
    current_cost_e4: i64,
    active_tasks: u32,
    daily_spent_e4: i64,
    was_over: bool,
}

pub struct CapacityMonitor {
    limits: Limits,
    time_based_usage: TimeBasedUsage,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    inner: Arc<RwLock<Inner>>,
}

impl CapacityMonitor {
    pub fn new(limits: Limits, time_based_usage: TimeBasedUsage, event_bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            time_based_usage,
            event_bus,
            clock,
            inner: Arc::new(RwLock::new(Inner {
                current_tokens: 0,
                current_cost_e4: 0,
                active_tasks: 0,
                daily_spent_e4: 0,
                was_over: false,
            })),
        }
    }

    fn classify_hour(&self, hour: u32) -> Mode {
        if self.time_based_usage.day_mode_hours.contains(&hour) {
            Mode::Day
        } else if self.time_based_usage.night_mode_hours.contains(&hour) {
            Mode::Night
        } else {
            Mode::OffHours
        }
    }

    fn thresholds_for(&self, mode: Mode) -> ModeThresholds {
        match mode {
            Mode::Day => self.time_based_usage.day_mode_thresholds.clone(),
            Mode::Night => self.time_based_usage.night_mode_thresholds.clone(),
            Mode::OffHours => self.time_based_usage.off_hours(),
        }
    }

    /// The mode at `now`, plus the next two wall-clock anchors the
    /// monitor must wake up at (next mode-boundary hour, next midnight).
    pub fn mode_info(&self, now: DateTime<Utc>) -> ModeInfo {
        if !self.time_based_usage.enabled {
            return ModeInfo {
                mode: Mode::Day,
                next_mode_switch: now + Duration::days(1),
                next_midnight: next_midnight(now),
            };
        }

        let current_mode = self.classify_hour(now.hour());
        let hour_start = now
            .date_naive()
            .and_hms_opt(now.hour(), 0, 0)
            .unwrap()
            .and_utc();

        let mut next_switch = hour_start + Duration::hours(24);
        for i in 1..=24 {
            let candidate = hour_start + Duration::hours(i);
            if self.classify_hour(candidate.hour()) != current_mode {
                next_switch = candidate;
                break;
            }
        }

        ModeInfo {
            mode: current_mode,
            next_mode_switch: next_switch,
            next_midnight: next_midnight(now),
        }
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> CapacityUsage {
        let mode = self.mode_info(now).mode;
        let thresholds = self.thresholds_for(mode);
        let inner = self.inner.read().await;
        CapacityUsage {
            current_tokens: inner.current_tokens,
            current_cost_e4: inner.current_cost_e4,
            active_tasks: inner.active_tasks,
            tokens_threshold: thresholds.tokens_threshold,
            cost_threshold_e4: thresholds.cost_threshold_e4,
            concurrency_cap: thresholds.concurrency_cap,
            daily_budget_e4: self.limits.daily_budget_e4,
            daily_spent_e4: inner.daily_spent_e4,
        }
    }

    /// `isCapacityAvailable`: would adding this estimate keep every axis
    /// within the current mode's thresholds?
    pub async fn is_capacity_available(&self, estimated_tokens: u64, estimated_cost_e4: i64, now: DateTime<Utc>) -> Decision {
        let snapshot = self.snapshot(now).await;
        match snapshot.first_violated_reason(estimated_tokens, estimated_cost_e4) {
            Some(reason) => Decision::deny(
                format!("capacity denied on {reason:?} axis"),
                reason,
            ),
            None => Decision::allow(),
        }
    }

    pub async fn reserve_task(&self) {
        let mut inner = self.inner.write().await;
        inner.active_tasks += 1;
    }

    /// Release a concurrency slot and re-evaluate; freeing a slot may
    /// drop the snapshot under threshold and should wake paused tasks.
    pub async fn release_task(&self, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.write().await;
            inner.active_tasks = inner.active_tasks.saturating_sub(1);
        }
        self.recompute_and_maybe_restore(now).await;
    }

    /// `onUsageUpdate`: apply a usage delta and emit `capacity:restored`
    /// if the snapshot flips from over to under threshold.
    pub async fn on_usage_update(&self, delta: &Usage, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.write().await;
            inner.current_tokens += delta.total_tokens;
            inner.current_cost_e4 += delta.estimated_cost_e4;
            inner.daily_spent_e4 += delta.estimated_cost_e4;
        }
        self.recompute_and_maybe_restore(now).await;
    }

    async fn recompute_and_maybe_restore(&self, now: DateTime<Utc>) {
        let snapshot = self.snapshot(now).await;
        let now_under = snapshot.is_under_all_thresholds();

        let mut inner = self.inner.write().await;
        if inner.was_over && now_under {
            drop(inner);
            self.event_bus.publish(
                crate::domain::models::EventPayload::CapacityRestored {
                    reason: RestoreReason::CapacityDropped,
                },
                now,
            );
            inner = self.inner.write().await;
        }
        inner.was_over = !now_under;
    }

    /// Spawn the wake-up loop: sleeps until `min(nextModeSwitch,
    /// nextMidnight) + 1s`, then re-evaluates. Runs until the returned
    /// handle is aborted (the Scheduler owns shutdown).
    pub fn spawn_wake_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.clock.now();
                let today = now.date_naive();
                let info = self.mode_info(now);
                let wake_at = info.next_mode_switch.min(info.next_midnight) + Duration::seconds(1);
                self.clock.sleep_until(wake_at).await;

                let woke_at = self.clock.now();
                let crossed_midnight = woke_at.date_naive() != today;
                let new_info = self.mode_info(woke_at);

                if crossed_midnight {
                    let mut inner = self.inner.write().await;
                    inner.daily_spent_e4 = 0;
                    drop(inner);
                    self.event_bus.publish(
                        crate::domain::models::EventPayload::CapacityRestored {
                            reason: RestoreReason::BudgetReset,
                        },
                        woke_at,
                    );
                } else if new_info.mode != info.mode {
                    let before = self.thresholds_for(info.mode);
                    let after = self.thresholds_for(new_info.mode);
                    let improved = after.concurrency_cap >= before.concurrency_cap
                        || after.tokens_threshold >= before.tokens_threshold
                        || after.cost_threshold_e4 >= before.cost_threshold_e4;
                    if improved {
                        self.event_bus.publish(
                            crate::domain::models::EventPayload::CapacityRestored {
                                reason: RestoreReason::ModeSwitch,
                            },
                            woke_at,
                        );
                    }
                }
            }
        })
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc()
}
