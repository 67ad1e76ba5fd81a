// Cluster placement strategies used by the scheduling reconciler

pub mod external;
pub mod failover;

pub use external::ExternalStrategy;
pub use failover::FailoverStrategy;

use crate::config::{StrategyConfig, StrategyKind};
use crate::errors::StrategyError;
use crate::models::{Agent, ExecutionRecord};

/// Placement decision for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    pub cluster: String,
}

/// Fixed strategy for agents that do not support multi-cluster placement
static PASSTHROUGH: SchedulingStrategy = SchedulingStrategy::Passthrough;

/// SchedulingStrategy decides which cluster a record runs on
///
/// Strategies never mutate the record they are given.
#[derive(Debug)]
pub enum SchedulingStrategy {
    /// Keep the cluster the record asked for
    Passthrough,
    /// Remap clusters through a static table
    Failover(FailoverStrategy),
    /// Ask a remote scheduling service, with a TTL cache
    External(ExternalStrategy),
}

impl SchedulingStrategy {
    /// Build the configured strategy
    pub fn from_config(config: &StrategyConfig) -> Result<Self, StrategyError> {
        match config.kind {
            StrategyKind::Passthrough => Ok(SchedulingStrategy::Passthrough),
            StrategyKind::Failover => Ok(SchedulingStrategy::Failover(FailoverStrategy::new(
                config.failover.clone(),
            ))),
            StrategyKind::External => {
                let external = config.external.as_ref().ok_or_else(|| {
                    StrategyError::InvalidConfiguration(
                        "external strategy requires an external section".to_string(),
                    )
                })?;
                Ok(SchedulingStrategy::External(ExternalStrategy::from_config(
                    external,
                )?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulingStrategy::Passthrough => "passthrough",
            SchedulingStrategy::Failover(_) => "failover",
            SchedulingStrategy::External(_) => "external",
        }
    }

    /// Strategy to use for a record run by `agent`
    ///
    /// Cluster-aware agents get `self`; every other agent gets passthrough.
    pub fn for_agent(&self, agent: Agent) -> &SchedulingStrategy {
        if agent.is_cluster_aware() {
            self
        } else {
            &PASSTHROUGH
        }
    }

    /// Decide the cluster for `record`
    pub async fn schedule(&self, record: &ExecutionRecord) -> Result<ScheduleResult, StrategyError> {
        match self {
            SchedulingStrategy::Passthrough => Ok(ScheduleResult {
                cluster: record.spec.cluster.clone(),
            }),
            SchedulingStrategy::Failover(failover) => Ok(failover.schedule(record)),
            SchedulingStrategy::External(external) => external.schedule(record).await,
        }
    }
}
