//! The one `AgentRuntime` implementation that ships in this crate. A
//! real runtime talks to an actual coding agent; this one completes
//! every stage immediately with a synthetic result, so the daemon has
//! something to dispatch to out of the box. An embedding application
//! swaps this out for its own `AgentRuntime` before constructing the
//! `Scheduler`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::ports::{AgentEvent, AgentRuntime, AgentStageHandle, StageContext};

pub struct InMemoryAgentRuntime;

impl InMemoryAgentRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InMemoryAgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for InMemoryAgentRuntime {
    async fn dispatch(&self, ctx: StageContext) -> Box<dyn AgentStageHandle> {
        Box::new(InMemoryStageHandle {
            task_id: ctx.task.id,
            stage_name: ctx.stage.name,
            emitted: false,
        })
    }
}

struct InMemoryStageHandle {
    task_id: Uuid,
    stage_name: String,
    emitted: bool,
}

#[async_trait]
impl AgentStageHandle for InMemoryStageHandle {
    async fn next_event(&mut self) -> Option<AgentEvent> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        Some(AgentEvent::Result {
            summary: format!("stage '{}' completed (in-memory runtime)", self.stage_name),
        })
    }

    fn task_id(&self) -> Uuid {
        self.task_id
    }
}
