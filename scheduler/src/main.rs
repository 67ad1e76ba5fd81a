// Scheduler binary entry point: runs the periodic trigger loop

use anyhow::{Context, Result};
use common::config::{reload_loop, ConfigProvider, Settings, WatchedConfig};
use common::db::DbPool;
use common::schedule::CronTracker;
use common::scheduler::{Scheduler, SchedulerEngine};
use common::store::PostgresRecordStore;
use common::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const CONFIG_DIR: &str = "config";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load_from_path(CONFIG_DIR).context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        namespace = %settings.scheduler.namespace,
        periodics = settings.periodics.len(),
        scheduling_enabled = settings.scheduler.scheduling_enabled,
        "Starting CI orchestrator scheduler"
    );

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        anyhow::anyhow!("Database initialization error: {}", e)
    })?;
    db_pool
        .health_check()
        .await
        .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))?;
    db_pool
        .migrate()
        .await
        .map_err(|e| anyhow::anyhow!("Database migration error: {}", e))?;
    let store = Arc::new(PostgresRecordStore::new(db_pool.clone()));

    let cron = Arc::new(
        CronTracker::from_config(&settings.cron)
            .map_err(|e| anyhow::anyhow!("Cron initialization error: {}", e))?,
    );
    info!(timezone = %cron.timezone(), "Cron schedules evaluated in configured timezone");

    let reload_every = settings.scheduler.config_reload_seconds;
    let (config, config_tx) = WatchedConfig::new(settings);
    let config: Arc<dyn ConfigProvider> = Arc::new(config);

    let engine = Arc::new(SchedulerEngine::new(store, cron, Arc::clone(&config)));

    let reload_handle = if reload_every > 0 {
        info!(every_seconds = reload_every, "Configuration reloading enabled");
        Some(tokio::spawn(reload_loop(
            PathBuf::from(CONFIG_DIR),
            Duration::from_secs(reload_every),
            config_tx,
            engine.shutdown_receiver(),
        )))
    } else {
        drop(config_tx);
        None
    };

    let engine_for_shutdown = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        engine_for_shutdown.stop().await;
    });

    engine.start().await;

    if let Some(handle) = reload_handle {
        let _ = handle.await;
    }
    db_pool.close().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
