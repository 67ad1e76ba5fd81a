// Reconciler dispatcher
//
// Feeds record keys from the store watch stream and a periodic resync into a
// work queue, and drains it with a fixed pool of workers.

use super::controller::{admits, ClusterReconciler};
use super::queue::WorkQueue;
use crate::config::WorkerConfig;
use crate::errors::{ReconcileError, StoreError};
use crate::models::{ExecutionState, RecordKey};
use crate::retry::ExponentialBackoff;
use crate::store::{RecordFilter, RecordStore};
use crate::telemetry;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

const REQUEUE_JITTER: f64 = 0.1;

/// Runs the cluster scheduling reconciler over a worker pool
pub struct Dispatcher {
    reconciler: Arc<ClusterReconciler>,
    store: Arc<dyn RecordStore>,
    queue: Arc<WorkQueue<RecordKey>>,
    config: WorkerConfig,
    namespace: String,
    shutdown_tx: broadcast::Sender<()>,
    /// Set by `stop`, so a stop before `run` subscribes is not lost
    stopped: AtomicBool,
}

impl Dispatcher {
    /// `namespace` is the namespace listed on resync
    pub fn new(
        reconciler: Arc<ClusterReconciler>,
        store: Arc<dyn RecordStore>,
        config: WorkerConfig,
        namespace: impl Into<String>,
    ) -> Self {
        let backoff = ExponentialBackoff::with_config(
            Duration::from_millis(config.requeue_base_delay_ms),
            Duration::from_secs(config.requeue_max_delay_seconds),
            REQUEUE_JITTER,
        );
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            reconciler,
            store,
            queue: Arc::new(WorkQueue::new(backoff)),
            config,
            namespace: namespace.into(),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal `run` to stop
    pub fn stop(&self) {
        info!("Stopping reconciler dispatcher");
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn queue(&self) -> &Arc<WorkQueue<RecordKey>> {
        &self.queue
    }

    /// Run sources and workers until `stop` is called
    ///
    /// Fails only if the watch stream cannot be opened.
    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub async fn run(&self) -> Result<(), StoreError> {
        // Every task's receiver exists before the stop flag is checked
        let mut shutdown_rx = self.shutdown_receiver();
        let watch_shutdown = self.shutdown_receiver();
        let resync_shutdown = self.shutdown_receiver();
        let worker_shutdown: Vec<_> = (0..self.config.concurrency)
            .map(|_| self.shutdown_receiver())
            .collect();
        if self.stopped.load(Ordering::SeqCst) {
            info!("Reconciler dispatcher stopped before it started");
            return Ok(());
        }

        let watch = self.store.watch().await?;

        info!(
            concurrency = self.config.concurrency,
            resync_interval_seconds = self.config.resync_interval_seconds,
            "Starting reconciler dispatcher"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.concurrency + 2);
        tasks.push(tokio::spawn(watch_source(
            watch,
            Arc::clone(&self.queue),
            watch_shutdown,
        )));
        tasks.push(tokio::spawn(resync_source(
            Arc::clone(&self.store),
            self.namespace.clone(),
            Duration::from_secs(self.config.resync_interval_seconds.max(1)),
            Arc::clone(&self.queue),
            resync_shutdown,
        )));
        for (worker_id, shutdown) in worker_shutdown.into_iter().enumerate() {
            tasks.push(tokio::spawn(worker(
                worker_id,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                self.config.reconcile_timeout_seconds,
                shutdown,
            )));
        }

        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, stopping reconciler workers");
        self.queue.shutdown();

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
        }

        info!("Reconciler dispatcher stopped");
        Ok(())
    }
}

async fn watch_source(
    mut watch: crate::store::RecordWatch,
    queue: Arc<WorkQueue<RecordKey>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = watch.next() => match event {
                Some(event) if admits(&event) => {
                    debug!(record = %event.key, "Queueing record from watch");
                    queue.add(event.key);
                    telemetry::update_reconcile_queue_depth(queue.len());
                }
                Some(_) => {}
                None => {
                    warn!("Record watch stream ended, relying on resync");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn resync_source(
    store: Arc<dyn RecordStore>,
    namespace: String,
    every: Duration,
    queue: Arc<WorkQueue<RecordKey>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let filter = RecordFilter::state(ExecutionState::Scheduling);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.list(&namespace, &filter).await {
                    Ok(records) => {
                        debug!(count = records.len(), "Resync found scheduling records");
                        for record in records {
                            queue.add(record.key());
                        }
                        telemetry::update_reconcile_queue_depth(queue.len());
                    }
                    Err(e) => {
                        warn!(error = %e, namespace = %namespace, "Resync list failed");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn worker(
    worker_id: usize,
    reconciler: Arc<ClusterReconciler>,
    queue: Arc<WorkQueue<RecordKey>>,
    timeout_seconds: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let timeout = Duration::from_secs(timeout_seconds);

    while let Some(key) = queue.get().await {
        telemetry::update_reconcile_queue_depth(queue.len());

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, reconciler.reconcile(&key)) => {
                Some(result.unwrap_or(Err(ReconcileError::Timeout(timeout_seconds))))
            }
            _ = shutdown.recv() => None,
        };
        let Some(result) = result else {
            // In-flight reconciliation dropped on shutdown
            queue.done(key);
            break;
        };

        match result {
            Ok(outcome) => {
                debug!(worker_id, record = %key, outcome = ?outcome, "Reconciled");
                queue.forget(&key);
            }
            Err(e) => {
                telemetry::record_reconcile_error();
                warn!(
                    worker_id,
                    record = %key,
                    failures = queue.num_requeues(&key) + 1,
                    error = %e,
                    "Reconcile failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(key);
    }

    debug!(worker_id, "Reconciler worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionRecord, PeriodicDefinition};
    use crate::store::{InMemoryRecordStore, MockRecordStore};
    use crate::strategy::{FailoverStrategy, SchedulingStrategy};
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            resync_interval_seconds: 60,
            reconcile_timeout_seconds: 5,
            requeue_base_delay_ms: 5,
            requeue_max_delay_seconds: 1,
        }
    }

    fn record(job: &str, cluster: &str) -> ExecutionRecord {
        let mut definition = PeriodicDefinition::with_interval(job, 60);
        definition.cluster = cluster.to_string();
        ExecutionRecord::new_periodic(
            &definition,
            "ci",
            ExecutionState::Scheduling,
            Utc::now(),
            &BTreeMap::new(),
        )
    }

    fn failover() -> Arc<SchedulingStrategy> {
        Arc::new(SchedulingStrategy::Failover(FailoverStrategy::new(
            HashMap::from([("build-1".to_string(), "build-2".to_string())]),
        )))
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resync_and_watch_both_feed_workers() {
        let existing = record("existing", "build-1");
        let store = Arc::new(InMemoryRecordStore::with_records(vec![existing.clone()]).await);
        let reconciler = Arc::new(ClusterReconciler::new(store.clone(), failover()));
        let dispatcher = Arc::new(Dispatcher::new(reconciler, store.clone(), config(), "ci"));

        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run().await })
        };

        // Picked up by the initial resync
        let key = existing.key();
        wait_for(|| {
            let store = store.clone();
            let key = key.clone();
            async move { store.get(&key).await.unwrap().status.state == ExecutionState::Triggered }
        })
        .await;

        // Picked up from the watch stream
        let fresh = store.create(&record("fresh", "other")).await.unwrap();
        let key = fresh.key();
        wait_for(|| {
            let store = store.clone();
            let key = key.clone();
            async move { store.get(&key).await.unwrap().status.state == ExecutionState::Triggered }
        })
        .await;

        assert_eq!(store.get(&existing.key()).await.unwrap().spec.cluster, "build-2");
        assert_eq!(store.get(&fresh.key()).await.unwrap().spec.cluster, "other");

        dispatcher.stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried() {
        let pending = record("flaky", "build-1");
        let key = pending.key();

        let gets = Arc::new(AtomicUsize::new(0));
        let patches = Arc::new(AtomicUsize::new(0));

        let mut store = MockRecordStore::new();
        store
            .expect_watch()
            .returning(|| Ok(futures::stream::pending().boxed()));
        let listed = pending.clone();
        store
            .expect_list()
            .returning(move |_, _| Ok(vec![listed.clone()]));
        let fetched = pending.clone();
        let get_count = gets.clone();
        store.expect_get().returning(move |_| {
            if get_count.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Database("connection reset".to_string()))
            } else {
                Ok(fetched.clone())
            }
        });
        let patch_count = patches.clone();
        let patched = pending.clone();
        store.expect_patch().returning(move |_, patch| {
            patch_count.fetch_add(1, Ordering::SeqCst);
            let mut updated = patched.clone();
            patch.apply(&mut updated)?;
            Ok(updated)
        });

        let store: Arc<dyn RecordStore> = Arc::new(store);
        let reconciler = Arc::new(ClusterReconciler::new(store.clone(), failover()));
        let dispatcher = Arc::new(Dispatcher::new(reconciler, store, config(), "ci"));

        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run().await })
        };

        wait_for(|| {
            let patches = patches.clone();
            async move { patches.load(Ordering::SeqCst) >= 1 }
        })
        .await;
        assert!(gets.load(Ordering::SeqCst) >= 2);
        // Success clears the failure count
        wait_for(|| {
            let dispatcher = dispatcher.clone();
            let key = key.clone();
            async move { dispatcher.queue().num_requeues(&key) == 0 }
        })
        .await;

        dispatcher.stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_failure_is_returned() {
        let mut store = MockRecordStore::new();
        store
            .expect_watch()
            .returning(|| Err(StoreError::Watch("listener refused".to_string())));

        let store: Arc<dyn RecordStore> = Arc::new(store);
        let reconciler = Arc::new(ClusterReconciler::new(store.clone(), failover()));
        let dispatcher = Dispatcher::new(reconciler, store, config(), "ci");

        assert!(matches!(dispatcher.run().await, Err(StoreError::Watch(_))));
    }

    #[tokio::test]
    async fn test_stop_before_run_is_honored() {
        let mut store = MockRecordStore::new();
        store.expect_watch().never();

        let store: Arc<dyn RecordStore> = Arc::new(store);
        let reconciler = Arc::new(ClusterReconciler::new(store.clone(), failover()));
        let dispatcher = Dispatcher::new(reconciler, store, config(), "ci");

        dispatcher.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
