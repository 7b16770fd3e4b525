//! End-to-end scenarios exercising the Capacity Monitor, Scheduler,
//! Facade, and Auto-Resume Coordinator together against an in-memory
//! SQLite store, driven by a `VirtualClock` so wall-clock advances are
//! deterministic rather than real sleeps.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use apex_orchestrator::adapters::sqlite::{create_migrated_test_pool, SqliteTaskStore};
use apex_orchestrator::adapters::InMemoryAgentRuntime;
use apex_orchestrator::config::{Limits, ModeThresholds, TimeBasedUsage};
use apex_orchestrator::domain::errors::OrchestratorResult;
use apex_orchestrator::domain::models::{
    Autonomy, EventPayload, PauseReason, RestoreReason, Subtask, Task, TaskPriority, TaskStatus, Usage, Workflow,
};
use apex_orchestrator::domain::ports::{AgentRuntime, Clock, TaskFilter, TaskStore, VirtualClock};
use apex_orchestrator::services::{AutoResumeCoordinator, CapacityMonitor, EventBus, Facade, Scheduler, WorkflowRegistry};
use async_trait::async_trait;

/// Wraps a real store and forces `update_task` to fail for one chosen
/// task id once armed, simulating a resume that throws (e.g. the
/// concurrent-cancel race `update_task`'s optimistic lock guards
/// against) without depending on real scheduling timing.
struct FlakyStore {
    inner: Arc<dyn TaskStore>,
    fail_update_for: std::sync::Mutex<Option<uuid::Uuid>>,
}

impl FlakyStore {
    fn new(inner: Arc<dyn TaskStore>) -> Self {
        Self { inner, fail_update_for: std::sync::Mutex::new(None) }
    }

    fn arm(&self, id: uuid::Uuid) {
        *self.fail_update_for.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create_task(&self, task: Task) -> OrchestratorResult<uuid::Uuid> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: uuid::Uuid) -> OrchestratorResult<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn update_task(&self, task: &Task) -> OrchestratorResult<()> {
        if *self.fail_update_for.lock().unwrap() == Some(task.id) {
            return Err(apex_orchestrator::domain::errors::OrchestratorError::StoreUnavailable(
                "simulated resume failure".into(),
            ));
        }
        self.inner.update_task(task).await
    }

    async fn list_tasks(&self, filter: TaskFilter) -> OrchestratorResult<Vec<Task>> {
        self.inner.list_tasks(filter).await
    }

    async fn get_paused_tasks_for_resume(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Task>> {
        self.inner.get_paused_tasks_for_resume(now).await
    }

    async fn claim_pending_task(&self, id: uuid::Uuid, now: DateTime<Utc>) -> OrchestratorResult<Option<Task>> {
        self.inner.claim_pending_task(id, now).await
    }

    async fn create_subtask(&self, subtask: Subtask) -> OrchestratorResult<uuid::Uuid> {
        self.inner.create_subtask(subtask).await
    }

    async fn list_subtasks(&self, parent_task_id: uuid::Uuid) -> OrchestratorResult<Vec<Subtask>> {
        self.inner.list_subtasks(parent_task_id).await
    }

    async fn update_subtask_status(
        &self,
        id: uuid::Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        self.inner.update_subtask_status(id, status, now).await
    }

    async fn apply_usage_delta(&self, id: uuid::Uuid, delta: Usage, now: DateTime<Utc>) -> OrchestratorResult<()> {
        self.inner.apply_usage_delta(id, delta, now).await
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.inner.close().await
    }

    async fn start_session(&self, session_id: uuid::Uuid, now: DateTime<Utc>) -> OrchestratorResult<()> {
        self.inner.start_session(session_id, now).await
    }

    async fn get_active_session(&self) -> OrchestratorResult<Option<apex_orchestrator::domain::models::ActiveSession>> {
        self.inner.get_active_session().await
    }
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

struct Harness {
    store: Arc<dyn TaskStore>,
    event_bus: Arc<EventBus>,
    capacity: Arc<CapacityMonitor>,
    clock: Arc<VirtualClock>,
    auto_resume: Arc<AutoResumeCoordinator>,
}

async fn plain_store() -> Arc<dyn TaskStore> {
    let pool = create_migrated_test_pool().await.unwrap();
    Arc::new(SqliteTaskStore::new(pool))
}

async fn harness_with_store(store: Arc<dyn TaskStore>, start: DateTime<Utc>, time_based_usage: TimeBasedUsage) -> Harness {
    let clock = Arc::new(VirtualClock::new(start));
    let event_bus = Arc::new(EventBus::new());
    let capacity = Arc::new(CapacityMonitor::new(
        Limits::default(),
        time_based_usage,
        event_bus.clone(),
        clock.clone() as Arc<dyn Clock>,
    ));
    let registry = Arc::new(WorkflowRegistry::new(vec![Workflow::new("solo", vec![])]));
    let runtime: Arc<dyn AgentRuntime> = Arc::new(InMemoryAgentRuntime::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry,
        capacity.clone(),
        event_bus.clone(),
        runtime,
        clock.clone() as Arc<dyn Clock>,
        StdDuration::from_secs(3600),
        StdDuration::from_secs(1),
    ));
    let facade = Arc::new(Facade::new(store.clone(), event_bus.clone(), scheduler, clock.clone() as Arc<dyn Clock>));
    let auto_resume = Arc::new(AutoResumeCoordinator::new(
        store.clone(),
        event_bus.clone(),
        facade,
        clock.clone() as Arc<dyn Clock>,
    ));
    Harness { store, event_bus, capacity, clock, auto_resume }
}

async fn harness(start: DateTime<Utc>, time_based_usage: TimeBasedUsage) -> Harness {
    harness_with_store(plain_store().await, start, time_based_usage).await
}

async fn paused_task(
    store: &Arc<dyn TaskStore>,
    priority: TaskPriority,
    reason: PauseReason,
    resume_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> uuid::Uuid {
    let mut task = Task::new(
        "do it".into(),
        "done".into(),
        "solo".into(),
        Autonomy::Autonomous,
        priority,
        "/tmp".into(),
        1,
        created_at,
    );
    task.created_at = created_at;
    let id = store.create_task(task.clone()).await.unwrap();
    task = store.get_task(id).await.unwrap().unwrap();
    task.transition_to(TaskStatus::Running, created_at).unwrap();
    store.update_task(&task).await.unwrap();
    task.pause(reason, resume_after, created_at).unwrap();
    store.update_task(&task).await.unwrap();
    id
}

fn day_night_config() -> TimeBasedUsage {
    TimeBasedUsage {
        enabled: true,
        day_mode_hours: (9..18).collect(),
        night_mode_hours: (18..24).chain(0..6).collect(),
        day_mode_thresholds: ModeThresholds { concurrency_cap: 1, tokens_threshold: 100_000, cost_threshold_e4: 100_000 },
        night_mode_thresholds: ModeThresholds { concurrency_cap: 3, tokens_threshold: 100_000, cost_threshold_e4: 100_000 },
        off_hours_thresholds: None,
    }
}

/// Scenario 1: day -> night upswing resumes a capacity-paused task.
#[tokio::test]
async fn day_to_night_upswing_resumes_capacity_paused_task() {
    let h = harness(at("2026-01-01T17:00:00Z"), day_night_config()).await;
    let t1 = paused_task(&h.store, TaskPriority::Urgent, PauseReason::Capacity, None, at("2026-01-01T17:00:00Z")).await;

    let mut rx = h.event_bus.subscribe();
    h.auto_resume.clone().spawn();
    let wake_loop = h.capacity.clone().spawn_wake_loop();

    h.clock.set(at("2026-01-01T18:00:01Z"));

    let mut saw_mode_switch_restore = false;
    let summary = loop {
        let event = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("event expected")
            .unwrap();
        match event.payload {
            EventPayload::CapacityRestored { reason: RestoreReason::ModeSwitch } => {
                saw_mode_switch_restore = true;
            }
            EventPayload::TasksAutoResumed { reason, resumed_count, errors } => {
                break (reason, resumed_count, errors);
            }
            _ => {}
        }
    };
    wake_loop.abort();

    assert!(saw_mode_switch_restore, "expected a capacity:restored(mode_switch) event");
    assert_eq!(summary.0, RestoreReason::ModeSwitch);
    assert_eq!(summary.1, 1);
    assert!(summary.2.is_empty());

    let task = h.store.get_task(t1).await.unwrap().unwrap();
    assert_ne!(task.status, TaskStatus::Paused);
}

/// Scenario 2: crossing midnight zeroes the daily budget and resumes a
/// budget-paused task.
#[tokio::test]
async fn midnight_reset_resumes_budget_paused_task() {
    let h = harness(at("2026-01-01T23:55:00Z"), day_night_config()).await;
    let t2 = paused_task(&h.store, TaskPriority::Normal, PauseReason::Budget, None, at("2026-01-01T23:55:00Z")).await;

    let mut rx = h.event_bus.subscribe();
    h.auto_resume.clone().spawn();
    let wake_loop = h.capacity.clone().spawn_wake_loop();

    h.clock.set(at("2026-01-02T00:00:01Z"));

    let mut saw_budget_reset = false;
    let summary = loop {
        let event = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("event expected")
            .unwrap();
        match event.payload {
            EventPayload::CapacityRestored { reason: RestoreReason::BudgetReset } => {
                saw_budget_reset = true;
            }
            EventPayload::TasksAutoResumed { reason, resumed_count, .. } => {
                break (reason, resumed_count);
            }
            _ => {}
        }
    };
    wake_loop.abort();

    assert!(saw_budget_reset, "expected a capacity:restored(budget_reset) event");
    assert_eq!(summary.0, RestoreReason::BudgetReset);
    assert_eq!(summary.1, 1);

    let task = h.store.get_task(t2).await.unwrap().unwrap();
    assert_ne!(task.status, TaskStatus::Paused);
}

/// Scenario 3: only the auto-resumable `capacity` reason is resumed;
/// `manual`/`user_request` pauses are left untouched.
#[tokio::test]
async fn non_resumable_pauses_are_left_alone() {
    let h = harness(at("2026-01-01T10:00:00Z"), TimeBasedUsage::default()).await;
    let manual = paused_task(&h.store, TaskPriority::Normal, PauseReason::Manual, None, at("2026-01-01T10:00:00Z")).await;
    let user_requested = paused_task(&h.store, TaskPriority::Normal, PauseReason::UserRequest, None, at("2026-01-01T10:00:00Z")).await;
    let capacity = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, None, at("2026-01-01T10:00:00Z")).await;

    let mut rx = h.event_bus.subscribe();
    h.auto_resume.clone().spawn();
    h.event_bus.publish(EventPayload::CapacityRestored { reason: RestoreReason::CapacityDropped }, h.clock.now());

    let summary = loop {
        let event = rx.recv().await.unwrap();
        if let EventPayload::TasksAutoResumed { resumed_count, errors, .. } = event.payload {
            break (resumed_count, errors);
        }
    };
    assert_eq!(summary.0, 1);
    assert!(summary.1.is_empty());

    assert_eq!(h.store.get_task(manual).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_eq!(h.store.get_task(user_requested).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_ne!(h.store.get_task(capacity).await.unwrap().unwrap().status, TaskStatus::Paused);
}

/// Scenario 4: the `resumeAfter` gate excludes a task whose resume time
/// is still in the future.
#[tokio::test]
async fn resume_after_gate_only_resumes_elapsed_task() {
    let h = harness(at("2026-01-01T10:00:00Z"), TimeBasedUsage::default()).await;
    let now = h.clock.now();
    let future_task = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, Some(now + Duration::hours(24)), now).await;
    let elapsed_task = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, Some(now - Duration::minutes(1)), now).await;

    let mut rx = h.event_bus.subscribe();
    h.auto_resume.clone().spawn();
    h.event_bus.publish(EventPayload::CapacityRestored { reason: RestoreReason::CapacityDropped }, now);

    let summary = loop {
        let event = rx.recv().await.unwrap();
        if let EventPayload::TasksAutoResumed { resumed_count, .. } = event.payload {
            break resumed_count;
        }
    };
    assert_eq!(summary, 1);

    assert_eq!(h.store.get_task(future_task).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_ne!(h.store.get_task(elapsed_task).await.unwrap().unwrap().status, TaskStatus::Paused);
}

/// Scenario 5: resumable tasks are listed in priority order.
#[tokio::test]
async fn resumable_tasks_are_ordered_by_priority() {
    let h = harness(at("2026-01-01T13:00:00Z"), TimeBasedUsage::default()).await;
    let urgent = paused_task(&h.store, TaskPriority::Urgent, PauseReason::Capacity, None, at("2026-01-01T10:00:00Z")).await;
    let normal = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, None, at("2026-01-01T11:00:00Z")).await;
    let low = paused_task(&h.store, TaskPriority::Low, PauseReason::Capacity, None, at("2026-01-01T12:00:00Z")).await;

    let ordered = h.store.get_paused_tasks_for_resume(h.clock.now()).await.unwrap();
    let ids: Vec<uuid::Uuid> = ordered.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![urgent, normal, low]);
}

/// Scenario 6: a failing resume does not abort the pass; the summary
/// reports the partial success and names the failed task.
#[tokio::test]
async fn partial_resume_failure_is_tolerated_and_reported() {
    let flaky = Arc::new(FlakyStore::new(plain_store().await));
    let store: Arc<dyn TaskStore> = flaky.clone();
    let h = harness_with_store(store, at("2026-01-01T10:00:00Z"), TimeBasedUsage::default()).await;

    let ok_task = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, None, at("2026-01-01T10:00:00Z")).await;
    let doomed_id = paused_task(&h.store, TaskPriority::Normal, PauseReason::Capacity, None, at("2026-01-01T10:00:01Z")).await;

    // Arm the failure only after setup finishes, so the resume attempt
    // itself (not the pause bookkeeping above) is what fails.
    flaky.arm(doomed_id);

    let mut rx = h.event_bus.subscribe();
    h.auto_resume.clone().spawn();
    h.event_bus.publish(EventPayload::CapacityRestored { reason: RestoreReason::CapacityDropped }, h.clock.now());

    let summary = loop {
        let event = rx.recv().await.unwrap();
        if let EventPayload::TasksAutoResumed { resumed_count, errors, .. } = event.payload {
            break (resumed_count, errors);
        }
    };
    assert_eq!(summary.0, 1);
    assert_eq!(summary.1, vec![doomed_id]);

    assert_ne!(h.store.get_task(ok_task).await.unwrap().unwrap().status, TaskStatus::Paused);
    assert_eq!(h.store.get_task(doomed_id).await.unwrap().unwrap().status, TaskStatus::Paused);
}
