// In-memory record store with broadcast change notifications

use super::{RecordEvent, RecordFilter, RecordPatch, RecordStore, RecordWatch};
use crate::errors::StoreError;
use crate::models::{ExecutionRecord, RecordKey};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 1024;

/// Record store kept in process memory
///
/// Used by tests and single-process deployments. Lagging watchers lose
/// events; the reconciler's periodic resync covers the gap.
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordKey, ExecutionRecord>>,
    version: AtomicI64,
    events: broadcast::Sender<RecordEvent>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: RwLock::new(BTreeMap::new()),
            version: AtomicI64::new(0),
            events,
        }
    }

    /// Build a store pre-populated with records, keeping their resource versions
    pub async fn with_records(records: impl IntoIterator<Item = ExecutionRecord>) -> Self {
        let store = Self::new();
        {
            let mut guard = store.records.write().await;
            for record in records {
                store
                    .version
                    .fetch_max(record.metadata.resource_version, Ordering::SeqCst);
                guard.insert(record.key(), record);
            }
        }
        store
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Replace a stored record wholesale, as an external actor would
    ///
    /// Bumps the resource version and emits a change event.
    pub async fn update(&self, mut record: ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        let key = record.key();
        let mut guard = self.records.write().await;
        if !guard.contains_key(&key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        record.metadata.resource_version = self.next_version();
        guard.insert(key, record.clone());
        drop(guard);
        self.notify(&record);
        Ok(record)
    }

    fn next_version(&self) -> i64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, record: &ExecutionRecord) {
        // No subscribers is not an error
        let _ = self.events.send(RecordEvent {
            key: record.key(),
            state: record.status.state,
        });
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list(
        &self,
        namespace: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard
            .values()
            .filter(|r| r.metadata.namespace == namespace && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &RecordKey) -> Result<ExecutionRecord, StoreError> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn create(&self, record: &ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        let key = record.key();
        let mut guard = self.records.write().await;
        if guard.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut stored = record.clone();
        stored.metadata.resource_version = self.next_version();
        guard.insert(key.clone(), stored.clone());
        drop(guard);

        debug!(record = %key, state = %stored.status.state, "Record created");
        self.notify(&stored);
        Ok(stored)
    }

    async fn patch(
        &self,
        key: &RecordKey,
        patch: &RecordPatch,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut guard = self.records.write().await;
        let current = guard
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut updated = current.clone();
        patch.apply(&mut updated)?;
        updated.metadata.resource_version = self.next_version();
        *current = updated.clone();
        drop(guard);

        debug!(record = %key, state = %updated.status.state, "Record patched");
        self.notify(&updated);
        Ok(updated)
    }

    async fn watch(&self) -> Result<RecordWatch, StoreError> {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Record watcher lagged, events dropped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
