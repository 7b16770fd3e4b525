//! Apex orchestrator daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use apex_orchestrator::adapters::sqlite::{initialize_database, SqliteTaskStore};
use apex_orchestrator::adapters::InMemoryAgentRuntime;
use apex_orchestrator::config::ConfigLoader;
use apex_orchestrator::domain::ports::{AgentRuntime, Clock, SystemClock, TaskStore};
use apex_orchestrator::logging;
use apex_orchestrator::services::{AutoResumeCoordinator, CapacityMonitor, EventBus, Facade, Scheduler, WorkflowRegistry};

/// Overrides for the handful of settings worth flipping from the
/// command line without editing `.apex/config.yaml`.
#[derive(Parser, Debug)]
#[command(name = "apex-orchestrator", version, about)]
struct Cli {
    /// Override `database.path`.
    #[arg(long, env = "APEX_DATABASE_PATH")]
    db_path: Option<String>,

    /// Override `logging.level` (trace, debug, info, warn, error).
    #[arg(long, env = "APEX_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load().context("failed to load configuration")?;
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    ConfigLoader::validate(&config).context("invalid configuration")?;

    let _log_guard = logging::init(&config.logging, None);

    let database_url = format!("sqlite:{}", config.database.path);
    let pool = initialize_database(&database_url)
        .await
        .context("failed to initialize database")?;

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let session_id = uuid::Uuid::new_v4();
    store
        .start_session(session_id, clock.now())
        .await
        .context("failed to record active session")?;
    tracing::info!(session_id = %session_id, "active session recorded");

    let event_bus = Arc::new(EventBus::new());
    let runtime: Arc<dyn AgentRuntime> = Arc::new(InMemoryAgentRuntime::new());
    let registry = Arc::new(WorkflowRegistry::new(Vec::new()));

    let capacity = Arc::new(CapacityMonitor::new(
        config.limits.clone(),
        config.time_based_usage.clone(),
        event_bus.clone(),
        clock.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry,
        capacity.clone(),
        event_bus.clone(),
        runtime,
        clock.clone(),
        Duration::from_millis(config.poll_interval_ms),
        Duration::from_millis(config.shutdown_drain_ms),
    ));

    let facade = Arc::new(Facade::new(store.clone(), event_bus.clone(), scheduler, clock.clone()));
    let auto_resume = Arc::new(AutoResumeCoordinator::new(store, event_bus, facade.clone(), clock));

    facade.initialize().await;
    let capacity_wake = capacity.spawn_wake_loop();
    let auto_resume_task = auto_resume.spawn();

    tracing::info!(
        db = %config.database.path,
        poll_interval_ms = config.poll_interval_ms,
        "apex-orchestrator started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received, draining in-flight work");
    capacity_wake.abort();
    auto_resume_task.abort();
    facade.shutdown().await;

    Ok(())
}
