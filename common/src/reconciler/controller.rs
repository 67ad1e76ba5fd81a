// Cluster scheduling reconciler
//
// Moves a record out of the scheduling state by asking the placement strategy
// for a cluster and committing it with an optimistic-concurrency patch.

use crate::errors::ReconcileError;
use crate::models::{ExecutionState, RecordKey};
use crate::store::{RecordEvent, RecordPatch, RecordStore};
use crate::strategy::SchedulingStrategy;
use crate::telemetry;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record was placed on the cluster and moved to triggered
    Scheduled { cluster: String },
    /// The record no longer exists
    NotFound,
    /// The record already left the scheduling state
    NotScheduling(ExecutionState),
}

impl ReconcileOutcome {
    /// Outcome label of the `scheduling_decisions_total` metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Scheduled { .. } => "scheduled",
            ReconcileOutcome::NotFound | ReconcileOutcome::NotScheduling(_) => "skipped",
        }
    }
}

/// Only records entering or sitting in the scheduling state are reconciled
pub fn admits(event: &RecordEvent) -> bool {
    event.state == ExecutionState::Scheduling
}

pub struct ClusterReconciler {
    store: Arc<dyn RecordStore>,
    strategy: Arc<SchedulingStrategy>,
}

impl ClusterReconciler {
    pub fn new(store: Arc<dyn RecordStore>, strategy: Arc<SchedulingStrategy>) -> Self {
        Self { store, strategy }
    }

    /// Reconcile one record
    ///
    /// A strategy or store failure leaves the record untouched and is
    /// returned so the caller can requeue the key. A patch conflict means the
    /// record changed since it was read and is returned the same way.
    #[instrument(skip(self), fields(record = %key))]
    pub async fn reconcile(&self, key: &RecordKey) -> Result<ReconcileOutcome, ReconcileError> {
        let original = match self.store.get(key).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("Record gone, nothing to schedule");
                return Ok(self.skipped(ReconcileOutcome::NotFound));
            }
            Err(e) => return Err(e.into()),
        };

        if original.status.state != ExecutionState::Scheduling {
            debug!(state = %original.status.state, "Record no longer scheduling");
            return Ok(self.skipped(ReconcileOutcome::NotScheduling(original.status.state)));
        }

        let strategy = self.strategy.for_agent(original.spec.agent);
        let result = match strategy.schedule(&original).await {
            Ok(result) => result,
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Scheduling strategy failed");
                telemetry::record_scheduling_decision(strategy.name(), "failed");
                return Err(e.into());
            }
        };

        let patch = RecordPatch::scheduled(&original, result.cluster.as_str());
        if let Err(e) = self.store.patch(key, &patch).await {
            if e.is_conflict() {
                debug!(error = %e, "Record changed while scheduling");
            } else {
                warn!(error = %e, "Failed to commit scheduling decision");
            }
            telemetry::record_scheduling_decision(strategy.name(), "failed");
            return Err(e.into());
        }

        info!(
            job = %original.spec.job,
            agent = %original.spec.agent,
            strategy = strategy.name(),
            requested = %original.spec.cluster,
            cluster = %result.cluster,
            "Record scheduled"
        );
        telemetry::record_scheduling_decision(strategy.name(), "scheduled");

        Ok(ReconcileOutcome::Scheduled {
            cluster: result.cluster,
        })
    }

    fn skipped(&self, outcome: ReconcileOutcome) -> ReconcileOutcome {
        telemetry::record_scheduling_decision(self.strategy.name(), outcome.metric_label());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::models::{Agent, ExecutionRecord, PeriodicDefinition};
    use crate::store::{InMemoryRecordStore, MockRecordStore};
    use crate::strategy::FailoverStrategy;
    use chrono::Utc;
    use mockall::predicate::eq;
    use std::collections::{BTreeMap, HashMap};

    fn record(cluster: &str, agent: Agent, state: ExecutionState) -> ExecutionRecord {
        let mut definition = PeriodicDefinition::with_interval("job", 60);
        definition.cluster = cluster.to_string();
        definition.agent = agent;
        ExecutionRecord::new_periodic(&definition, "ci", state, Utc::now(), &BTreeMap::new())
    }

    fn failover() -> Arc<SchedulingStrategy> {
        Arc::new(SchedulingStrategy::Failover(FailoverStrategy::new(
            HashMap::from([("build-1".to_string(), "build-2".to_string())]),
        )))
    }

    #[tokio::test]
    async fn test_scheduling_record_is_placed_and_triggered() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = store
            .create(&record("build-1", Agent::Kubernetes, ExecutionState::Scheduling))
            .await
            .unwrap();

        let reconciler = ClusterReconciler::new(store.clone(), failover());
        let outcome = reconciler.reconcile(&created.key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Scheduled {
                cluster: "build-2".to_string()
            }
        );

        let stored = store.get(&created.key()).await.unwrap();
        assert_eq!(stored.spec.cluster, "build-2");
        assert_eq!(stored.status.state, ExecutionState::Triggered);
        assert_eq!(stored.metadata.labels, created.metadata.labels);
    }

    #[tokio::test]
    async fn test_jenkins_records_keep_their_cluster() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = store
            .create(&record("build-1", Agent::Jenkins, ExecutionState::Scheduling))
            .await
            .unwrap();

        let reconciler = ClusterReconciler::new(store.clone(), failover());
        reconciler.reconcile(&created.key()).await.unwrap();

        let stored = store.get(&created.key()).await.unwrap();
        assert_eq!(stored.spec.cluster, "build-1");
        assert_eq!(stored.status.state, ExecutionState::Triggered);
    }

    #[tokio::test]
    async fn test_already_triggered_record_is_left_alone() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = store
            .create(&record("build-1", Agent::Kubernetes, ExecutionState::Triggered))
            .await
            .unwrap();

        let reconciler = ClusterReconciler::new(store.clone(), failover());
        let outcome = reconciler.reconcile(&created.key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::NotScheduling(ExecutionState::Triggered)
        );
        assert_eq!(store.get(&created.key()).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_record_aborted_after_queueing_is_skipped() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = store
            .create(&record("build-1", Agent::Kubernetes, ExecutionState::Scheduling))
            .await
            .unwrap();

        let mut aborted = created.clone();
        aborted.status.state = ExecutionState::Aborted;
        store.update(aborted).await.unwrap();

        let reconciler = ClusterReconciler::new(store.clone(), failover());
        let outcome = reconciler.reconcile(&created.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotScheduling(ExecutionState::Aborted));
        assert_eq!(store.get(&created.key()).await.unwrap().spec.cluster, "build-1");
    }

    #[test]
    fn test_outcome_metric_labels() {
        let scheduled = ReconcileOutcome::Scheduled {
            cluster: "build-2".to_string(),
        };
        assert_eq!(scheduled.metric_label(), "scheduled");
        assert_eq!(ReconcileOutcome::NotFound.metric_label(), "skipped");
        assert_eq!(
            ReconcileOutcome::NotScheduling(ExecutionState::Triggered).metric_label(),
            "skipped"
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_a_no_op() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .returning(|key| Err(StoreError::NotFound(key.to_string())));
        store.expect_patch().never();

        let reconciler = ClusterReconciler::new(Arc::new(store), failover());
        let outcome = reconciler
            .reconcile(&RecordKey::new("ci", "gone"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_get_failure_is_returned() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .returning(|_| Err(StoreError::Database("timeout".to_string())));
        store.expect_patch().never();

        let reconciler = ClusterReconciler::new(Arc::new(store), failover());
        let err = reconciler
            .reconcile(&RecordKey::new("ci", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_conflict_is_returned_for_requeue() {
        let mut original = record("build-1", Agent::Kubernetes, ExecutionState::Scheduling);
        original.metadata.resource_version = 7;
        let key = original.key();

        let mut store = MockRecordStore::new();
        let fetched = original.clone();
        store
            .expect_get()
            .with(eq(key.clone()))
            .returning(move |_| Ok(fetched.clone()));
        store
            .expect_patch()
            .withf(|_, patch| {
                patch.resource_version == Some(7)
                    && patch.cluster.as_deref() == Some("build-2")
                    && patch.state == Some(ExecutionState::Triggered)
            })
            .times(1)
            .returning(|key, _| {
                Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: 7,
                    actual: 8,
                })
            });

        let reconciler = ClusterReconciler::new(Arc::new(store), failover());
        let err = reconciler.reconcile(&key).await.unwrap_err();
        match err {
            ReconcileError::Store(e) => assert!(e.is_conflict()),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_admission_predicate() {
        let key = RecordKey::new("ci", "a");
        assert!(admits(&RecordEvent {
            key: key.clone(),
            state: ExecutionState::Scheduling
        }));
        for state in [
            ExecutionState::Triggered,
            ExecutionState::Pending,
            ExecutionState::Success,
        ] {
            assert!(!admits(&RecordEvent {
                key: key.clone(),
                state
            }));
        }
    }
}
