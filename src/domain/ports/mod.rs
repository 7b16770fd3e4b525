pub mod agent_runtime;
pub mod clock;
pub mod task_store;

pub use agent_runtime::{AgentEvent, AgentRuntime, AgentStageHandle, CancelToken, StageContext};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use task_store::{TaskFilter, TaskStore};
