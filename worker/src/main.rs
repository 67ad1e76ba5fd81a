// Worker binary entry point: runs the cluster scheduling reconciler

use anyhow::{Context, Result};
use common::config::Settings;
use common::db::DbPool;
use common::reconciler::{ClusterReconciler, Dispatcher};
use common::store::{PostgresRecordStore, RecordStore};
use common::strategy::SchedulingStrategy;
use common::telemetry;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    let strategy = SchedulingStrategy::from_config(&settings.strategy).map_err(|e| {
        error!(error = %e, "Failed to build scheduling strategy");
        anyhow::anyhow!("Strategy initialization error: {}", e)
    })?;

    info!(
        strategy = strategy.name(),
        concurrency = settings.worker.concurrency,
        namespace = %settings.scheduler.namespace,
        "Starting CI orchestrator worker"
    );

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        anyhow::anyhow!("Database initialization error: {}", e)
    })?;
    db_pool
        .health_check()
        .await
        .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))?;
    // Migrations are applied by the scheduler
    let store: Arc<dyn RecordStore> = Arc::new(PostgresRecordStore::new(db_pool.clone()));

    let reconciler = Arc::new(ClusterReconciler::new(Arc::clone(&store), Arc::new(strategy)));
    let dispatcher = Arc::new(Dispatcher::new(
        reconciler,
        store,
        settings.worker.clone(),
        settings.scheduler.namespace.clone(),
    ));

    let dispatcher_for_shutdown = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received, initiating graceful shutdown");
        dispatcher_for_shutdown.stop();
    });

    let result = dispatcher.run().await;

    db_pool.close().await;
    telemetry::shutdown_tracer();

    result.map_err(|e| anyhow::anyhow!("Reconciler error: {}", e))?;
    info!("Worker shutdown complete");
    Ok(())
}
