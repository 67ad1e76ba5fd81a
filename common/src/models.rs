// Data models for execution records and periodic job definitions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::ParseIntError;
use std::str::FromStr;
use uuid::Uuid;

/// Label carrying the job definition name on every record
pub const JOB_LABEL: &str = "ci-orchestrator.io/job";

/// Label carrying the job type on every record
pub const JOB_TYPE_LABEL: &str = "ci-orchestrator.io/type";

/// Label carrying the decimal retry counter of a periodic record
pub const RETRY_LABEL: &str = "ci-orchestrator.io/retry";

// ============================================================================
// Enumerations
// ============================================================================

/// JobType identifies which kind of definition produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Presubmit => write!(f, "presubmit"),
            JobType::Postsubmit => write!(f, "postsubmit"),
            JobType::Periodic => write!(f, "periodic"),
            JobType::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "presubmit" => Ok(JobType::Presubmit),
            "postsubmit" => Ok(JobType::Postsubmit),
            "periodic" => Ok(JobType::Periodic),
            "batch" => Ok(JobType::Batch),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// Agent is the execution backend that will eventually run a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Agent {
    #[default]
    Kubernetes,
    Jenkins,
    TektonPipeline,
    /// Any agent this core does not know about
    #[serde(other)]
    Other,
}

impl Agent {
    /// Agents that understand multi-cluster placement.
    ///
    /// Only records for these agents may have their cluster rewritten by a
    /// configured scheduling strategy.
    pub fn is_cluster_aware(&self) -> bool {
        matches!(self, Agent::Kubernetes | Agent::TektonPipeline)
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Agent::Kubernetes => write!(f, "kubernetes"),
            Agent::Jenkins => write!(f, "jenkins"),
            Agent::TektonPipeline => write!(f, "tekton-pipeline"),
            Agent::Other => write!(f, "other"),
        }
    }
}

/// ExecutionState is the lifecycle state of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Waiting for a cluster assignment
    Scheduling,
    /// Cluster assigned, ready to be picked up by an agent
    Triggered,
    Pending,
    Success,
    Failure,
    Error,
    Aborted,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Scheduling => write!(f, "scheduling"),
            ExecutionState::Triggered => write!(f, "triggered"),
            ExecutionState::Pending => write!(f, "pending"),
            ExecutionState::Success => write!(f, "success"),
            ExecutionState::Failure => write!(f, "failure"),
            ExecutionState::Error => write!(f, "error"),
            ExecutionState::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduling" => Ok(ExecutionState::Scheduling),
            "triggered" => Ok(ExecutionState::Triggered),
            "pending" => Ok(ExecutionState::Pending),
            "success" => Ok(ExecutionState::Success),
            "failure" => Ok(ExecutionState::Failure),
            "error" => Ok(ExecutionState::Error),
            "aborted" => Ok(ExecutionState::Aborted),
            _ => Err(format!("Invalid execution state: {}", s)),
        }
    }
}

// ============================================================================
// Periodic Definitions
// ============================================================================

/// RetryPolicy controls re-running a periodic job after an unsuccessful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total runs allowed for one lineage, including the first
    pub max_attempts: u32,
    /// Minimum time between the start of a run and its retry
    #[serde(default)]
    pub interval_seconds: u64,
    /// Retry after every run, not only until the first success
    #[serde(default)]
    pub run_all: bool,
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        seconds(self.interval_seconds)
    }
}

/// PeriodicDefinition is a configured job that runs on an interval or cron
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicDefinition {
    pub name: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default)]
    pub agent: Agent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Cluster used when a definition does not name one
pub fn default_cluster() -> String {
    "default".to_string()
}

impl PeriodicDefinition {
    /// Create an interval-driven definition with default placement
    pub fn with_interval(name: impl Into<String>, interval_seconds: u64) -> Self {
        Self {
            name: name.into(),
            cluster: default_cluster(),
            agent: Agent::default(),
            cron: None,
            interval_seconds: Some(interval_seconds),
            minimum_interval_seconds: None,
            retry: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Create a cron-driven definition with default placement
    pub fn with_cron(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            cron: Some(expression.into()),
            interval_seconds: None,
            ..Self::with_interval(name, 0)
        }
    }

    /// The cron expression, if one is configured and non-blank
    pub fn cron_expression(&self) -> Option<&str> {
        self.cron.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_seconds.map(seconds)
    }

    pub fn minimum_interval(&self) -> Option<Duration> {
        self.minimum_interval_seconds.map(seconds)
    }
}

// ============================================================================
// Execution Records
// ============================================================================

/// RecordKey identifies a record inside the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Assigned by the store, bumped on every write
    #[serde(default)]
    pub resource_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSpec {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub job: String,
    pub cluster: String,
    pub agent: Agent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub state: ExecutionState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// ExecutionRecord represents one invocation of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub metadata: RecordMeta,
    pub spec: RecordSpec,
    pub status: RecordStatus,
}

impl ExecutionRecord {
    /// Stamp a new record for a periodic definition
    ///
    /// Labels and annotations are copied out of the definition; `extra_labels`
    /// are merged on top of the copy so the definition is never touched.
    pub fn new_periodic(
        definition: &PeriodicDefinition,
        namespace: &str,
        state: ExecutionState,
        now: DateTime<Utc>,
        extra_labels: &BTreeMap<String, String>,
    ) -> Self {
        let mut labels = definition.labels.clone();
        labels.extend(extra_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.insert(JOB_LABEL.to_string(), definition.name.clone());
        labels.insert(JOB_TYPE_LABEL.to_string(), JobType::Periodic.to_string());

        Self {
            metadata: RecordMeta {
                name: Uuid::new_v4().to_string(),
                namespace: namespace.to_string(),
                labels,
                annotations: definition.annotations.clone(),
                resource_version: 0,
            },
            spec: RecordSpec {
                job_type: JobType::Periodic,
                job: definition.name.clone(),
                cluster: definition.cluster.clone(),
                agent: definition.agent,
                cron: definition.cron.clone(),
                interval_seconds: definition.interval_seconds,
                minimum_interval_seconds: definition.minimum_interval_seconds,
                retry: definition.retry.clone(),
            },
            status: RecordStatus {
                state,
                start_time: now,
                completion_time: None,
                description: None,
            },
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// A record is complete once it has a completion time
    pub fn is_complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    /// Retry counter carried on the record, 0 when the label is absent
    pub fn retry_count(&self) -> Result<u32, ParseIntError> {
        match self.metadata.labels.get(RETRY_LABEL) {
            Some(value) => value.trim().parse::<u32>(),
            None => Ok(0),
        }
    }
}

// chrono durations are bounded to i64 milliseconds
fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(i64::MAX as u64 / 1000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_display() {
        for state in [
            ExecutionState::Scheduling,
            ExecutionState::Triggered,
            ExecutionState::Pending,
            ExecutionState::Success,
            ExecutionState::Failure,
            ExecutionState::Error,
            ExecutionState::Aborted,
        ] {
            assert_eq!(state.to_string().parse::<ExecutionState>(), Ok(state));
        }
        assert!("running".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn test_unknown_agent_deserializes_as_other() {
        let agent: Agent = serde_json::from_str("\"buildkite\"").unwrap();
        assert_eq!(agent, Agent::Other);
        assert!(!agent.is_cluster_aware());

        let agent: Agent = serde_json::from_str("\"tekton-pipeline\"").unwrap();
        assert_eq!(agent, Agent::TektonPipeline);
        assert!(agent.is_cluster_aware());
        assert!(!Agent::Jenkins.is_cluster_aware());
    }

    #[test]
    fn test_new_periodic_copies_template_without_sharing() {
        let mut definition = PeriodicDefinition::with_interval("nightly", 3600);
        definition.labels.insert("team".to_string(), "infra".to_string());

        let mut extra = BTreeMap::new();
        extra.insert(RETRY_LABEL.to_string(), "2".to_string());

        let record = ExecutionRecord::new_periodic(
            &definition,
            "ci",
            ExecutionState::Scheduling,
            Utc::now(),
            &extra,
        );

        assert_eq!(record.metadata.namespace, "ci");
        assert_eq!(record.metadata.labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(record.metadata.labels.get(RETRY_LABEL).map(String::as_str), Some("2"));
        assert_eq!(record.metadata.labels.get(JOB_LABEL).map(String::as_str), Some("nightly"));
        assert_eq!(record.spec.job_type, JobType::Periodic);
        assert_eq!(record.status.state, ExecutionState::Scheduling);
        assert!(!record.is_complete());

        // The definition's template is untouched
        assert_eq!(definition.labels.len(), 1);
        assert!(!definition.labels.contains_key(RETRY_LABEL));
    }

    #[test]
    fn test_retry_count_parsing() {
        let definition = PeriodicDefinition::with_interval("job", 60);
        let mut record = ExecutionRecord::new_periodic(
            &definition,
            "ci",
            ExecutionState::Triggered,
            Utc::now(),
            &BTreeMap::new(),
        );
        assert_eq!(record.retry_count(), Ok(0));

        record.metadata.labels.insert(RETRY_LABEL.to_string(), "3".to_string());
        assert_eq!(record.retry_count(), Ok(3));

        record.metadata.labels.insert(RETRY_LABEL.to_string(), "three".to_string());
        assert!(record.retry_count().is_err());
    }

    #[test]
    fn test_blank_cron_is_ignored() {
        let mut definition = PeriodicDefinition::with_cron("c", "  ");
        assert_eq!(definition.cron_expression(), None);
        definition.cron = Some("0 * * * *".to_string());
        assert_eq!(definition.cron_expression(), Some("0 * * * *"));
    }

    #[test]
    fn test_record_serialization_uses_type_field() {
        let definition = PeriodicDefinition::with_interval("job", 60);
        let record = ExecutionRecord::new_periodic(
            &definition,
            "ci",
            ExecutionState::Triggered,
            Utc::now(),
            &BTreeMap::new(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["spec"]["type"], "periodic");
        assert_eq!(json["status"]["state"], "triggered");
        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
