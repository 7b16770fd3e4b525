//! Public operations layer: `submitTask`/`pauseTask`/`resumeTask`/
//! `cancelTask`, an event handler registry (`on`/`off`), and lifecycle
//! (`initialize`/`shutdown`). Every mutation goes through the Store;
//! every event goes through the bus.
//!
//! Grounded in the teacher's `event_reactor.rs` handler registry
//! (`HandlerId`, per-handler error isolation so one callback can't block
//! delivery to the rest). Simplified from the teacher's priority/circuit-
//! breaker/replay machinery, none of which this spec calls for: handler
//! registration lives behind an `RwLock` held only long enough to
//! snapshot the handler list before each dispatch, so registering a
//! handler never blocks delivery and vice versa.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{Autonomy, Event, EventPayload, PauseReason, Task, TaskPriority, TaskStatus};
use crate::domain::ports::Clock;
use crate::domain::ports::TaskStore;
use crate::services::event_bus::EventBus;
use crate::services::scheduler::Scheduler;

/// Identifies a registered event handler so it can later be removed
/// with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

pub type EventHandlerFn =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Registration {
    id: HandlerId,
    /// `None` matches every event; `Some(name)` matches `EventPayload::name()`.
    event_name: Option<&'static str>,
    handler: EventHandlerFn,
}

/// Orchestrator Facade: the one surface external callers use.
pub struct Facade {
    store: Arc<dyn TaskStore>,
    event_bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<Vec<Registration>>,
    dispatch_task: RwLock<Option<JoinHandle<()>>>,
}

impl Facade {
    pub fn new(
        store: Arc<dyn TaskStore>,
        event_bus: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            event_bus,
            scheduler,
            clock,
            handlers: RwLock::new(Vec::new()),
            dispatch_task: RwLock::new(None),
        }
    }

    /// Starts the Scheduler's tick loop and the internal fan-out task
    /// that delivers bus events to registered handlers.
    pub async fn initialize(self: &Arc<Self>) {
        self.scheduler.start();

        let this = self.clone();
        let mut rx = self.event_bus.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.dispatch(event).await;
            }
        });
        *self.dispatch_task.write().await = Some(task);
    }

    /// Stops the Scheduler (draining in-flight stages) and the event
    /// fan-out task. Idempotent.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        if let Some(task) = self.dispatch_task.write().await.take() {
            task.abort();
        }
    }

    async fn dispatch(&self, event: Event) {
        // Snapshot under the lock, then dispatch outside it: a handler
        // registered mid-delivery observes events strictly after its
        // own registration, and never blocks concurrent (de)registration.
        let snapshot: Vec<EventHandlerFn> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .filter(|r| r.event_name.is_none() || r.event_name == Some(event.payload.name()))
                .map(|r| r.handler.clone())
                .collect()
        };
        let event_name = event.payload.name();
        for handler in snapshot {
            // `AssertUnwindSafe` is sound here: a panicking handler's
            // future is dropped immediately after, never polled again.
            let outcome = std::panic::AssertUnwindSafe(handler(event.clone()))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                let message = panic_message(&panic);
                tracing::error!(event = event_name, panic = %message, "event handler panicked, continuing delivery");
            }
        }
    }

    /// Register a handler for `event_name` (the canonical name from
    /// `EventPayload::name`, e.g. `"task:completed"`), or every event if
    /// `event_name` is `None`. Returns an id usable with `off`.
    pub async fn on(&self, event_name: Option<&'static str>, handler: EventHandlerFn) -> HandlerId {
        let id = HandlerId::new();
        self.handlers.write().await.push(Registration { id, event_name, handler });
        id
    }

    pub async fn off(&self, id: HandlerId) {
        self.handlers.write().await.retain(|r| r.id != id);
    }

    /// Create and persist a new task in `pending`, waking the scheduler
    /// so it doesn't wait out a full poll interval to notice it.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_task(
        &self,
        description: String,
        acceptance_criteria: String,
        workflow_name: String,
        autonomy: Autonomy,
        priority: TaskPriority,
        project_path: String,
        max_retries: u32,
    ) -> OrchestratorResult<Uuid> {
        let now = self.clock.now();
        let task = Task::new(
            description,
            acceptance_criteria,
            workflow_name,
            autonomy,
            priority,
            project_path,
            max_retries,
            now,
        );
        task.validate()?;
        let id = self.store.create_task(task).await?;
        self.scheduler.wake_now();
        Ok(id)
    }

    /// Pause a running task with `reason`. Only valid while `running`.
    pub async fn pause_task(&self, id: Uuid, reason: PauseReason) -> OrchestratorResult<()> {
        let now = self.clock.now();
        let mut task = self
            .store
            .get_task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(id))?;
        task.pause(reason, None, now)?;
        self.store.update_task(&task).await?;
        self.event_bus.publish(
            EventPayload::TaskPaused { task_id: id, reason, resume_after: None },
            now,
        );
        Ok(())
    }

    /// Resume a paused task back to `running`, handing it to the
    /// Scheduler to continue its workflow from where it left off.
    pub async fn resume_task(&self, id: Uuid) -> OrchestratorResult<()> {
        self.scheduler.resume_task(id).await
    }

    /// Cancel a task. A `running` task is signalled and cancellation is
    /// honoured at the stage's next suspension point; `pending` and
    /// `paused` tasks are cancelled immediately. Idempotent: cancelling
    /// an already-terminal task is a no-op.
    pub async fn cancel_task(&self, id: Uuid) -> OrchestratorResult<()> {
        let now = self.clock.now();
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(id))?;

        if task.status.is_terminal() {
            return Ok(());
        }
        if task.status == TaskStatus::Running {
            self.scheduler.cancel_task(id).await;
            return Ok(());
        }

        let mut task = task;
        task.transition_to(TaskStatus::Cancelled, now)?;
        self.store.update_task(&task).await?;
        self.event_bus.publish(EventPayload::TaskCancelled { task_id: id }, now);
        Ok(())
    }
}

/// Best-effort extraction of a panic payload's message, for logging.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
