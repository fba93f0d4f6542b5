//! windlass scheduler daemon.
//!
//! Single binary driving the scheduling cycle against the shared database:
//! dependency synthesis, workflow progression, and task placement.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use windlass_scheduler::{
    config::Config,
    db::Database,
    dispatch::LoggingDispatcher,
    locking::PgAdvisoryLock,
    managers::{DependencyManager, SchedulerWorker, TaskManager, WorkflowManager},
    sinks::{LoggingEventSink, LoggingNotificationSink},
    store::PgStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WINDLASS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting windlass scheduler");
    info!(
        schedule_interval_secs = config.scheduler.schedule_interval.as_secs(),
        start_task_limit = config.scheduler.start_task_limit,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store = Arc::new(PgStore::new(db.clone()));
    let lock = Arc::new(PgAdvisoryLock::new(db.clone()));
    let events = Arc::new(LoggingEventSink);
    let notifications = Arc::new(LoggingNotificationSink);
    let dispatcher = Arc::new(LoggingDispatcher);

    let worker = SchedulerWorker::new(
        DependencyManager::new(store.clone(), events.clone(), lock.clone()),
        WorkflowManager::new(
            store.clone(),
            events.clone(),
            notifications.clone(),
            lock.clone(),
            dispatcher.clone(),
        ),
        TaskManager::new(
            store,
            events,
            notifications,
            lock,
            dispatcher,
            config.scheduler.clone(),
        ),
        config.scheduler.schedule_interval,
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the scheduler worker in background
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for scheduler worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
