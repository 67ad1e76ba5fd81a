// Static cluster failover mapping

use super::ScheduleResult;
use crate::models::ExecutionRecord;
use std::collections::HashMap;
use tracing::debug;

/// Substitutes a record's cluster when it appears in the failover table
#[derive(Debug, Clone, Default)]
pub struct FailoverStrategy {
    mappings: HashMap<String, String>,
}

impl FailoverStrategy {
    pub fn new(mappings: HashMap<String, String>) -> Self {
        Self { mappings }
    }

    pub fn schedule(&self, record: &ExecutionRecord) -> ScheduleResult {
        let requested = &record.spec.cluster;
        match self.mappings.get(requested) {
            Some(alternate) => {
                debug!(
                    job = %record.spec.job,
                    requested = %requested,
                    cluster = %alternate,
                    "Failing over to alternate cluster"
                );
                ScheduleResult {
                    cluster: alternate.clone(),
                }
            }
            None => ScheduleResult {
                cluster: requested.clone(),
            },
        }
    }
}
