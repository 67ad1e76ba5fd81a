// PostgreSQL record store
//
// Records are stored as JSONB with their lookup columns denormalized. Every
// insert and update fires a NOTIFY on the `execution_records` channel (see the
// migration), which backs the watch stream.

use super::{RecordEvent, RecordFilter, RecordPatch, RecordStore, RecordWatch};
use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{ExecutionRecord, RecordKey};
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use tracing::{debug, instrument, warn};

/// Channel the change trigger notifies on
pub const NOTIFY_CHANNEL: &str = "execution_records";

/// Record store backed by a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: DbPool,
}

impl PostgresRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn with_version((Json(mut record), version): (Json<ExecutionRecord>, i64)) -> ExecutionRecord {
    record.metadata.resource_version = version;
    record
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, filter))]
    async fn list(
        &self,
        namespace: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, (Json<ExecutionRecord>, i64)>(
            r#"
            SELECT record, resource_version
            FROM execution_records
            WHERE namespace = $1
              AND ($2::TEXT IS NULL OR job_type = $2)
              AND ($3::TEXT IS NULL OR state = $3)
            ORDER BY name
            "#,
        )
        .bind(namespace)
        .bind(filter.job_type.map(|t| t.to_string()))
        .bind(filter.state.map(|s| s.to_string()))
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows.into_iter().map(with_version).collect())
    }

    #[instrument(skip(self), fields(record = %key))]
    async fn get(&self, key: &RecordKey) -> Result<ExecutionRecord, StoreError> {
        sqlx::query_as::<_, (Json<ExecutionRecord>, i64)>(
            r#"
            SELECT record, resource_version
            FROM execution_records
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(self.pool.pool())
        .await?
        .map(with_version)
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, record), fields(record = %record.key(), job = %record.spec.job))]
    async fn create(&self, record: &ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO execution_records (
                namespace, name, job, job_type, state, resource_version, record
            )
            VALUES ($1, $2, $3, $4, $5, nextval('execution_records_version'), $6)
            RETURNING resource_version
            "#,
        )
        .bind(&record.metadata.namespace)
        .bind(&record.metadata.name)
        .bind(&record.spec.job)
        .bind(record.spec.job_type.to_string())
        .bind(record.status.state.to_string())
        .bind(Json(record))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists(_) => StoreError::AlreadyExists(record.key().to_string()),
            other => other,
        })?;

        let mut stored = record.clone();
        stored.metadata.resource_version = version;
        debug!(resource_version = version, "Record created");
        Ok(stored)
    }

    #[instrument(skip(self, patch), fields(record = %key))]
    async fn patch(
        &self,
        key: &RecordKey,
        patch: &RecordPatch,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        let current = sqlx::query_as::<_, (Json<ExecutionRecord>, i64)>(
            r#"
            SELECT record, resource_version
            FROM execution_records
            WHERE namespace = $1 AND name = $2
            FOR UPDATE
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?
        .map(with_version)
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut updated = current;
        patch.apply(&mut updated)?;

        let version: i64 = sqlx::query_scalar(
            r#"
            UPDATE execution_records
            SET record = $3,
                state = $4,
                resource_version = nextval('execution_records_version')
            WHERE namespace = $1 AND name = $2
            RETURNING resource_version
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(Json(&updated))
        .bind(updated.status.state.to_string())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        updated.metadata.resource_version = version;
        debug!(resource_version = version, state = %updated.status.state, "Record patched");
        Ok(updated)
    }

    async fn watch(&self) -> Result<RecordWatch, StoreError> {
        let mut listener = PgListener::connect_with(self.pool.pool())
            .await
            .map_err(|e| StoreError::Watch(format!("Failed to connect listener: {}", e)))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| StoreError::Watch(format!("Failed to listen: {}", e)))?;

        let stream = listener.into_stream().filter_map(|item| async move {
            match item {
                Ok(notification) => {
                    match serde_json::from_str::<RecordEvent>(notification.payload()) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(error = %e, payload = notification.payload(), "Ignoring malformed record notification");
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Record notification stream error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
