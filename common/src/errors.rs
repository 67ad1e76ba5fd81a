// Error handling framework

use thiserror::Error;

/// Record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict on {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Watch failed: {0}")]
    Watch(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Scheduling strategy errors
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Invalid strategy configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Scheduling request failed: {0}")]
    RequestFailed(String),
}

/// Cron signal source errors
#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}' for job {job}: {reason}")]
    InvalidExpression {
        job: String,
        expression: String,
        reason: String,
    },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("{} cron definition(s) rejected: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<CronError>),
}

/// Periodic trigger errors
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Failed to list execution records: {0}")]
    ListFailed(#[source] StoreError),

    #[error("Failed to create records for {} periodic job(s): {}", .0.len(), join_failures(.0))]
    CreateFailed(Vec<(String, StoreError)>),
}

/// Cluster scheduling reconciliation errors
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduling strategy failed: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Reconciliation timed out after {0} seconds")]
    Timeout(u64),
}

fn join_errors(errors: &[CronError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_failures(failures: &[(String, StoreError)]) -> String {
    failures
        .iter()
        .map(|(job, e)| format!("{}: {}", job, e))
        .collect::<Vec<_>>()
        .join("; ")
}

// Implement From for common external errors
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                match db_err.code().as_deref() {
                    Some("23505") => StoreError::AlreadyExists(db_err.message().to_string()),
                    _ => StoreError::Database(db_err.message().to_string()),
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
