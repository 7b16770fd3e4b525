//! Structured logging setup: JSON or pretty formatting via
//! `tracing-subscriber`, env-filter driven by the configured level.
//!
//! The teacher's own logging module was a stub (format/rotation/secret
//! scrubbing listed as aspirations, never implemented); this builds the
//! concrete subscriber the doc comments described.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the global tracing subscriber. Returns a guard that must
/// be held for the process lifetime when logging to a file — dropping
/// it flushes the non-blocking writer.
pub fn init(config: &LoggingConfig, log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "apex-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let builder = fmt().with_env_filter(filter).with_writer(writer);
            if config.format == "pretty" {
                builder.pretty().init();
            } else {
                builder.json().init();
            }
            Some(guard)
        }
        None => {
            let builder = fmt().with_env_filter(filter);
            if config.format == "pretty" {
                builder.pretty().init();
            } else {
                builder.json().init();
            }
            None
        }
    }
}
