// Record store abstraction shared by the trigger loop and the reconciler

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

use crate::errors::StoreError;
use crate::models::{ExecutionRecord, ExecutionState, JobType, RecordKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Selects records in a namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub job_type: Option<JobType>,
    pub state: Option<ExecutionState>,
}

impl RecordFilter {
    pub fn job_type(job_type: JobType) -> Self {
        Self {
            job_type: Some(job_type),
            state: None,
        }
    }

    pub fn state(state: ExecutionState) -> Self {
        Self {
            job_type: None,
            state: Some(state),
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.job_type.map_or(true, |t| record.spec.job_type == t)
            && self.state.map_or(true, |s| record.status.state == s)
    }
}

/// Field-scoped merge patch
///
/// Only the fields that are set are written. When `resource_version` is set
/// the patch is rejected with a conflict if the stored record changed since
/// it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub cluster: Option<String>,
    pub state: Option<ExecutionState>,
    pub resource_version: Option<i64>,
}

impl RecordPatch {
    /// Patch committing a placement decision for a record read as `original`
    pub fn scheduled(original: &ExecutionRecord, cluster: impl Into<String>) -> Self {
        Self {
            cluster: Some(cluster.into()),
            state: Some(ExecutionState::Triggered),
            resource_version: Some(original.metadata.resource_version),
        }
    }

    /// Check the precondition and write the patched fields into `record`
    pub fn apply(&self, record: &mut ExecutionRecord) -> Result<(), StoreError> {
        if let Some(expected) = self.resource_version {
            if expected != record.metadata.resource_version {
                return Err(StoreError::Conflict {
                    key: record.key().to_string(),
                    expected,
                    actual: record.metadata.resource_version,
                });
            }
        }
        if let Some(cluster) = &self.cluster {
            record.spec.cluster = cluster.clone();
        }
        if let Some(state) = self.state {
            record.status.state = state;
        }
        Ok(())
    }
}

/// Change notification emitted on every create and patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent {
    #[serde(flatten)]
    pub key: RecordKey,
    pub state: ExecutionState,
}

/// Stream of change notifications
pub type RecordWatch = BoxStream<'static, RecordEvent>;

/// Namespaced store of execution records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// List records in a namespace matching the filter
    async fn list(
        &self,
        namespace: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Fetch one record, `StoreError::NotFound` if it does not exist
    async fn get(&self, key: &RecordKey) -> Result<ExecutionRecord, StoreError>;

    /// Insert a new record and return it as stored
    async fn create(&self, record: &ExecutionRecord) -> Result<ExecutionRecord, StoreError>;

    /// Apply a field-scoped patch and return the updated record
    async fn patch(
        &self,
        key: &RecordKey,
        patch: &RecordPatch,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Subscribe to change notifications
    async fn watch(&self) -> Result<RecordWatch, StoreError>;
}
