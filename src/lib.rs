//! Apex orchestrator: a daemon core that schedules multi-stage agent
//! tasks under capacity and budget policy, persists them to SQLite,
//! and reacts to capacity recovery by auto-resuming paused work.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod logging;
pub mod services;
