// Periodic trigger engine
//
// Runs the trigger evaluation once per tick: lists the periodic records, syncs
// and drains the cron source, and creates the records the evaluation asks for.

use super::trigger::{evaluate, TriggerReason};
use crate::config::ConfigProvider;
use crate::errors::{StoreError, TriggerError};
use crate::models::{ExecutionRecord, ExecutionState, JobType, RETRY_LABEL};
use crate::schedule::CronSignalSource;
use crate::store::{RecordFilter, RecordStore};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Result of one trigger tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Periodic definitions evaluated
    pub evaluated: usize,
    /// Records created this tick
    pub created: Vec<ExecutionRecord>,
    /// Jobs whose record could not be created, with the cause
    pub failures: Vec<(String, StoreError)>,
    /// The cron source rejected part of the configuration
    pub cron_sync_failed: bool,
}

impl TickReport {
    /// Created records, or the aggregate of every creation failure
    pub fn into_result(self) -> Result<Vec<ExecutionRecord>, TriggerError> {
        if self.failures.is_empty() {
            Ok(self.created)
        } else {
            Err(TriggerError::CreateFailed(self.failures))
        }
    }
}

/// Scheduler trait for the periodic trigger loop
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the tick loop until stopped
    async fn start(&self);

    /// Signal the tick loop to stop after the current tick
    async fn stop(&self);

    /// Run a single tick at `now`
    ///
    /// Only a failure to list existing records fails the tick; creation
    /// failures are collected in the report.
    async fn sync(&self, now: DateTime<Utc>) -> Result<TickReport, TriggerError>;
}

/// Periodic trigger engine
pub struct SchedulerEngine {
    store: Arc<dyn RecordStore>,
    cron: Arc<dyn CronSignalSource>,
    config: Arc<dyn ConfigProvider>,
    shutdown_tx: broadcast::Sender<()>,
    /// Set by `stop`, so a stop before `start` subscribes is not lost
    stopped: AtomicBool,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cron: Arc<dyn CronSignalSource>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            store,
            cron,
            config,
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    async fn create_record(
        &self,
        record: ExecutionRecord,
        retry: bool,
    ) -> Result<ExecutionRecord, (String, StoreError)> {
        let job = record.spec.job.clone();
        match self.store.create(&record).await {
            Ok(created) => {
                info!(
                    job = %job,
                    record = %created.key(),
                    state = %created.status.state,
                    cluster = %created.spec.cluster,
                    retry = retry,
                    "Periodic record created"
                );
                telemetry::record_periodic_created(&job, retry);
                Ok(created)
            }
            Err(e) => {
                error!(job = %job, error = %e, "Failed to create periodic record");
                telemetry::record_periodic_create_failure(&job);
                Err((job, e))
            }
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) {
        let mut shutdown_rx = self.shutdown_receiver();
        if self.stopped.load(Ordering::SeqCst) {
            info!("Trigger loop stopped before it started");
            return;
        }

        let tick_interval = self.config.current().scheduler.tick_interval();
        info!(
            tick_interval_seconds = tick_interval.as_secs(),
            "Starting periodic trigger loop"
        );

        let mut ticker = interval(tick_interval);
        // A tick that outlives the interval skips the missed ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match self.sync(Utc::now()).await {
                        Ok(report) => {
                            let evaluated = report.evaluated;
                            match report.into_result() {
                                Ok(created) if !created.is_empty() => {
                                    info!(evaluated, created = created.len(), "Trigger tick completed");
                                }
                                Ok(_) => {
                                    debug!(evaluated, "Trigger tick completed, nothing to create");
                                }
                                Err(e) => {
                                    error!(error = %e, "Trigger tick completed with failures");
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Trigger tick aborted");
                        }
                    }
                    telemetry::record_tick_duration(started.elapsed().as_secs_f64());
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping trigger loop");
                    break;
                }
            }
        }

        info!("Periodic trigger loop stopped");
    }

    #[instrument(skip(self))]
    async fn stop(&self) {
        info!("Stopping periodic trigger loop");
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    #[instrument(skip(self))]
    async fn sync(&self, now: DateTime<Utc>) -> Result<TickReport, TriggerError> {
        let settings = self.config.current();
        let namespace = settings.scheduler.namespace.as_str();

        let records = self
            .store
            .list(namespace, &RecordFilter::job_type(JobType::Periodic))
            .await
            .map_err(TriggerError::ListFailed)?;

        let mut report = TickReport {
            evaluated: settings.periodics.len(),
            ..TickReport::default()
        };

        if let Err(e) = self.cron.sync_config(&settings.periodics, now) {
            warn!(error = %e, "Cron configuration sync failed, continuing with valid entries");
            report.cron_sync_failed = true;
        }
        let cron_fired: HashSet<String> = self.cron.queued_jobs(now).into_iter().collect();
        if !cron_fired.is_empty() {
            debug!(jobs = ?cron_fired, "Cron jobs fired");
        }

        let initial_state = if settings.scheduler.scheduling_enabled {
            ExecutionState::Scheduling
        } else {
            ExecutionState::Triggered
        };

        let pending = evaluate(now, &records, &settings.periodics, &cron_fired)
            .into_iter()
            .zip(settings.periodics.iter())
            .filter(|(decision, _)| decision.should_trigger())
            .map(|(decision, definition)| {
                let mut labels = BTreeMap::new();
                if let Some(count) = decision.retry_count {
                    labels.insert(RETRY_LABEL.to_string(), count.to_string());
                }
                debug!(job = %decision.job, reason = ?decision.reason, "Periodic job triggered");
                let record = ExecutionRecord::new_periodic(
                    definition,
                    namespace,
                    initial_state,
                    now,
                    &labels,
                );
                self.create_record(record, decision.reason == Some(TriggerReason::Retry))
            });

        for outcome in join_all(pending).await {
            match outcome {
                Ok(created) => report.created.push(created),
                Err(failure) => report.failures.push(failure),
            }
        }

        Ok(report)
    }
}
