//! Adapters implementing the domain's ports: persistence and the
//! in-memory stand-in for an agent runtime.

pub mod in_memory_runtime;
pub mod sqlite;

pub use in_memory_runtime::InMemoryAgentRuntime;
