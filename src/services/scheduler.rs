//! The daemon loop: claims eligible pending tasks, drives each through
//! its workflow, and routes agent output to the Store and event bus.
//!
//! Concurrency is capped via the Capacity Monitor's own concurrency
//! axis (the authoritative gate, since the mode-dependent cap changes
//! at runtime); a fixed-size `tokio::sync::Semaphore` additionally
//! bounds the number of concurrently spawned tokio tasks as a backstop,
//! since `Semaphore` permits can be added but not revoked and so cannot
//! track a shrinking cap directly. Each dispatched stage runs as its
//! own task and reports back via the agent runtime's event stream,
//! following the worker/channel shape of the teacher's
//! `swarm_orchestrator` module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock, Semaphore};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::subtask::all_complete_or_cancelled;
use crate::domain::models::{EventPayload, PauseReason, Stage, StageBlock, Subtask, Task, TaskStatus};
use crate::domain::ports::{AgentEvent, AgentRuntime, CancelToken, Clock, StageContext, TaskStore};
use crate::services::capacity_monitor::CapacityMonitor;
use crate::services::event_bus::EventBus;
use crate::services::workflow_registry::WorkflowRegistry;

const BACKSTOP_CONCURRENCY: usize = 64;

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkflowRegistry>,
    capacity: Arc<CapacityMonitor>,
    event_bus: Arc<EventBus>,
    runtime: Arc<dyn AgentRuntime>,
    clock: Arc<dyn Clock>,
    poll_interval: std::time::Duration,
    shutdown_drain: std::time::Duration,

    running: AtomicBool,
    shutting_down: AtomicBool,
    wake: Notify,
    permits: Arc<Semaphore>,
    in_flight: RwLock<HashMap<Uuid, CancelToken>>,
    in_flight_count: tokio::sync::Mutex<u32>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkflowRegistry>,
        capacity: Arc<CapacityMonitor>,
        event_bus: Arc<EventBus>,
        runtime: Arc<dyn AgentRuntime>,
        clock: Arc<dyn Clock>,
        poll_interval: std::time::Duration,
        shutdown_drain: std::time::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            capacity,
            event_bus,
            runtime,
            clock,
            poll_interval,
            shutdown_drain,
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            wake: Notify::new(),
            permits: Arc::new(Semaphore::new(BACKSTOP_CONCURRENCY)),
            in_flight: RwLock::new(HashMap::new()),
            in_flight_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Spawns the tick loop. Idempotent: a second call while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            while !this.shutting_down.load(Ordering::SeqCst) {
                if let Err(err) = this.tick().await {
                    tracing::error!(error = %err, "scheduler tick failed, continuing");
                }
                tokio::select! {
                    () = tokio::time::sleep(this.poll_interval) => {}
                    () = this.wake.notified() => {}
                }
            }
        }))
    }

    /// Signal the loop to stop, allowing in-flight stages up to the
    /// drain deadline before returning. Idempotent.
    pub async fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake.notify_waiters();
        let drain = chrono::Duration::from_std(self.shutdown_drain).unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = self.clock.now() + drain;
        loop {
            if *self.in_flight_count.lock().await == 0 || self.clock.now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wake the loop immediately instead of waiting for `pollInterval`.
    pub fn wake_now(&self) {
        self.wake.notify_waiters();
    }

    pub async fn cancel_task(&self, id: Uuid) -> bool {
        if let Some(token) = self.in_flight.read().await.get(&id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Resume a paused task: transitions it back to `running` and spawns
    /// its workflow continuation from where it left off (`run_workflow`
    /// resumes at `current_stage + 1`). Capacity is not re-checked here;
    /// the Facade only calls this once a reason to resume already holds.
    pub async fn resume_task(self: &Arc<Self>, id: Uuid) -> OrchestratorResult<()> {
        let now = self.clock.now();
        let mut task = self
            .store
            .get_task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(id))?;
        task.transition_to(TaskStatus::Running, now)?;
        self.store.update_task(&task).await?;
        self.event_bus
            .publish(EventPayload::TaskResumed { task_id: id }, now);

        self.capacity.reserve_task().await;
        {
            let mut count = self.in_flight_count.lock().await;
            *count += 1;
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return Ok(());
        };
        let cancel = CancelToken::new();
        self.in_flight.write().await.insert(task.id, cancel.clone());

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_workflow(task, cancel).await;
            drop(permit);
            {
                let mut count = scheduler.in_flight_count.lock().await;
                *count = count.saturating_sub(1);
            }
            scheduler.capacity.release_task(scheduler.clock.now()).await;
        });

        Ok(())
    }

    async fn tick(self: &Arc<Self>) -> OrchestratorResult<()> {
        let mut pending = self
            .store
            .list_tasks(crate::domain::ports::TaskFilter {
                statuses: Some(vec![TaskStatus::Pending]),
                ..Default::default()
            })
            .await?;

        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        for task in pending {
            self.try_dispatch(task).await;
        }
        Ok(())
    }

    /// Claims and (if admitted) dispatches one pending task. The claim
    /// and capacity bookkeeping happen inline so the next tick never
    /// sees a task this one already claimed; the workflow itself runs
    /// on its own spawned task so a slow task can't stall the tick loop
    /// from admitting others up to the permit budget.
    async fn try_dispatch(self: &Arc<Self>, task: Task) {
        let now = self.clock.now();
        let decision = self
            .capacity
            .is_capacity_available(task.usage.total_tokens, task.usage.estimated_cost_e4, now)
            .await;

        if !decision.allowed {
            // Claim first so the task's persisted version matches a
            // single `running` transition, then pause as a second,
            // independently-versioned update.
            let Ok(Some(mut claimed)) = self.store.claim_pending_task(task.id, now).await else {
                return;
            };
            let reason = decision.would_pause_as.unwrap_or(PauseReason::Capacity);
            if claimed.pause(reason, None, now).is_err() {
                return;
            }
            if self.store.update_task(&claimed).await.is_ok() {
                self.event_bus.publish(
                    EventPayload::TaskPaused { task_id: claimed.id, reason, resume_after: None },
                    now,
                );
            }
            return;
        }

        let Ok(Some(claimed)) = self.store.claim_pending_task(task.id, now).await else {
            return;
        };

        self.capacity.reserve_task().await;
        self.event_bus.publish(EventPayload::TaskStarted { task_id: claimed.id }, now);

        {
            let mut count = self.in_flight_count.lock().await;
            *count += 1;
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let cancel = CancelToken::new();
        self.in_flight.write().await.insert(claimed.id, cancel.clone());

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_workflow(claimed, cancel).await;
            drop(permit);

            {
                let mut count = scheduler.in_flight_count.lock().await;
                *count = count.saturating_sub(1);
            }
            scheduler.capacity.release_task(scheduler.clock.now()).await;
        });
    }

    async fn run_workflow(&self, mut task: Task, cancel: CancelToken) {
        let now = self.clock.now();
        let Ok(workflow) = self.registry.resolve(&task.workflow_name).map(Clone::clone) else {
            task.transition_to(TaskStatus::Failed, now).ok();
            let _ = self.store.update_task(&task).await;
            self.event_bus.publish(
                EventPayload::TaskFailed { task_id: task.id, reason: "unknown workflow".into() },
                now,
            );
            self.in_flight.write().await.remove(&task.id);
            return;
        };

        let blocks = self.registry.blocks(&workflow);
        let start_index = task
            .current_stage
            .as_ref()
            .and_then(|name| blocks.iter().position(|b| block_contains(b, name)))
            .map_or(0, |i| i + 1);

        for block in blocks.into_iter().skip(start_index) {
            if cancel.is_cancelled() {
                self.finish_cancelled(&mut task).await;
                return;
            }
            match self.run_block(&mut task, &block, &cancel).await {
                Ok(()) => {}
                Err((message, transient)) => {
                    self.finish_failed(&mut task, message, transient).await;
                    return;
                }
            }
        }

        let now = self.clock.now();
        let subtasks = self.store.list_subtasks(task.id).await.unwrap_or_default();
        if !all_complete_or_cancelled(&subtasks) {
            // The agent finished its stages but left child work open; hold
            // the task rather than reporting a completion that isn't real.
            // Not auto-resumable: a human or the runtime itself has to
            // close out the remaining subtasks before this can proceed.
            if task.pause(PauseReason::Dependency, None, now).is_ok() {
                let _ = self.store.update_task(&task).await;
                self.event_bus.publish(
                    EventPayload::TaskPaused { task_id: task.id, reason: PauseReason::Dependency, resume_after: None },
                    now,
                );
            }
            self.in_flight.write().await.remove(&task.id);
            return;
        }

        if task.transition_to(TaskStatus::Completed, now).is_ok() {
            let _ = self.store.update_task(&task).await;
            self.event_bus.publish(EventPayload::TaskCompleted { task_id: task.id }, now);
        }
        self.in_flight.write().await.remove(&task.id);
    }

    async fn run_block(&self, task: &mut Task, block: &StageBlock, cancel: &CancelToken) -> Result<(), (String, bool)> {
        match block {
            StageBlock::Single(stage) => {
                self.set_stage(task, stage).await;
                self.run_stage(task, stage, cancel).await
            }
            StageBlock::Parallel { group, members } => {
                let now = self.clock.now();
                self.event_bus.publish(
                    EventPayload::StageParallelStarted { task_id: task.id, group: group.clone() },
                    now,
                );

                let futures = members.iter().map(|stage| {
                    let task_snapshot = task.clone();
                    let stage = stage.clone();
                    let cancel = cancel.clone();
                    async move { self.run_stage_isolated(&task_snapshot, &stage, &cancel).await }
                });
                let results = futures::future::join_all(futures).await;

                let now = self.clock.now();
                if let Some(Err((message, transient))) = results.into_iter().find(Result::is_err) {
                    cancel.cancel();
                    self.event_bus.publish(
                        EventPayload::StageParallelCompleted { task_id: task.id, group: group.clone() },
                        now,
                    );
                    return Err((message, transient));
                }

                self.event_bus.publish(
                    EventPayload::StageParallelCompleted { task_id: task.id, group: group.clone() },
                    now,
                );
                Ok(())
            }
        }
    }

    async fn set_stage(&self, task: &mut Task, stage: &Stage) {
        task.current_stage = Some(stage.name.clone());
        task.current_agent = Some(stage.agent.clone());
        task.version += 1;
        task.updated_at = self.clock.now();
        let _ = self.store.update_task(task).await;
        self.event_bus.publish(
            EventPayload::TaskStageChanged { task_id: task.id, stage: stage.name.clone(), agent: stage.agent.clone() },
            self.clock.now(),
        );
    }

    async fn run_stage(&self, task: &mut Task, stage: &Stage, cancel: &CancelToken) -> Result<(), (String, bool)> {
        self.run_stage_isolated(task, stage, cancel).await
    }

    /// Dispatch and drain one stage. Doesn't mutate `task` status; the
    /// caller advances the cursor and persists stage-level changes.
    async fn run_stage_isolated(&self, task: &Task, stage: &Stage, cancel: &CancelToken) -> Result<(), (String, bool)> {
        let ctx = StageContext {
            task: task.clone(),
            stage: stage.clone(),
            input: task.description.clone(),
            cancel: cancel.clone(),
        };
        let mut handle = self.runtime.dispatch(ctx).await;

        loop {
            let event = tokio::select! {
                event = handle.next_event() => event,
                () = cancel.cancelled() => return Err(("cancelled".into(), false)),
            };

            match event {
                Some(AgentEvent::Thinking { summary }) => {
                    self.event_bus.publish(
                        EventPayload::AgentThinking { task_id: task.id, summary },
                        self.clock.now(),
                    );
                }
                Some(AgentEvent::Message { text }) => {
                    self.event_bus.publish(
                        EventPayload::AgentMessage { task_id: task.id, message: text },
                        self.clock.now(),
                    );
                }
                Some(AgentEvent::ToolUse { tool }) => {
                    self.event_bus.publish(
                        EventPayload::AgentToolUse { task_id: task.id, tool },
                        self.clock.now(),
                    );
                }
                Some(AgentEvent::UsageDelta { usage }) => {
                    let now = self.clock.now();
                    self.capacity.on_usage_update(&usage, now).await;
                    let _ = self.store.apply_usage_delta(task.id, usage, now).await;
                    self.event_bus.publish(
                        EventPayload::UsageUpdated {
                            task_id: task.id,
                            total_tokens: usage.total_tokens,
                            estimated_cost_e4: usage.estimated_cost_e4,
                        },
                        now,
                    );
                }
                Some(AgentEvent::SubtaskCreated { subtask_id, description }) => {
                    let now = self.clock.now();
                    let subtask = Subtask {
                        id: subtask_id,
                        parent_task_id: task.id,
                        description,
                        status: TaskStatus::Pending,
                        created_at: now,
                        updated_at: now,
                    };
                    let _ = self.store.create_subtask(subtask).await;
                    self.event_bus.publish(
                        EventPayload::SubtaskCreated { task_id: task.id, subtask_id },
                        now,
                    );
                }
                Some(AgentEvent::SubtaskCompleted { subtask_id, status }) => {
                    let now = self.clock.now();
                    let _ = self.store.update_subtask_status(subtask_id, status, now).await;
                    self.event_bus.publish(
                        EventPayload::SubtaskCompleted { task_id: task.id, subtask_id },
                        now,
                    );
                }
                Some(AgentEvent::AgentTransition { from, to }) => {
                    self.event_bus.publish(
                        EventPayload::AgentTransition { task_id: task.id, from, to },
                        self.clock.now(),
                    );
                }
                Some(AgentEvent::Result { .. }) => return Ok(()),
                Some(AgentEvent::Error { message, transient }) => return Err((message, transient)),
                None => return Err(("agent stream ended without a terminal event".into(), false)),
            }
        }
    }

    async fn finish_failed(&self, task: &mut Task, message: String, transient: bool) {
        let now = self.clock.now();
        if transient && task.can_retry() {
            task.retry_count += 1;
            if task.transition_to(TaskStatus::Failed, now).is_ok() {
                let _ = self.store.update_task(task).await;
            }
            let now = self.clock.now();
            if task.transition_to(TaskStatus::Pending, now).is_ok() {
                let _ = self.store.update_task(task).await;
            }
        } else if task.transition_to(TaskStatus::Failed, now).is_ok() {
            let _ = self.store.update_task(task).await;
            self.event_bus.publish(
                EventPayload::TaskFailed { task_id: task.id, reason: message },
                now,
            );
        }
        self.in_flight.write().await.remove(&task.id);
    }

    async fn finish_cancelled(&self, task: &mut Task) {
        let now = self.clock.now();
        if task.transition_to(TaskStatus::Cancelled, now).is_ok() {
            let _ = self.store.update_task(task).await;
            self.event_bus.publish(EventPayload::TaskCancelled { task_id: task.id }, now);
        }
        self.in_flight.write().await.remove(&task.id);
    }
}

fn block_contains(block: &StageBlock, stage_name: &str) -> bool {
    match block {
        StageBlock::Single(s) => s.name == stage_name,
        StageBlock::Parallel { members, .. } => members.iter().any(|s| s.name == stage_name),
    }
}
