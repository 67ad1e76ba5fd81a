// Periodic trigger decisions
//
// Pure evaluation of periodic definitions against the latest execution record
// of each job. The engine wraps this with the store and cron I/O.

use crate::models::{ExecutionRecord, PeriodicDefinition};
use crate::retry::{evaluate_retry, RetryDecision};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Why a definition triggers this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// No record exists for the job yet
    NoHistory,
    /// The interval or minimum interval since the last run elapsed
    IntervalElapsed,
    /// The job's cron fired and the previous run finished
    CronFired,
    /// The retry policy asks for another run
    Retry,
}

/// Decision for one periodic definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub job: String,
    /// Set when a new record should be created
    pub reason: Option<TriggerReason>,
    /// Retry counter to stamp on the new record
    pub retry_count: Option<u32>,
}

impl TriggerDecision {
    fn skip(job: &str) -> Self {
        Self {
            job: job.to_string(),
            reason: None,
            retry_count: None,
        }
    }

    pub fn should_trigger(&self) -> bool {
        self.reason.is_some()
    }
}

/// Latest record per job name, by start time
pub fn latest_by_job(records: &[ExecutionRecord]) -> HashMap<&str, &ExecutionRecord> {
    let mut latest: HashMap<&str, &ExecutionRecord> = HashMap::new();
    for record in records {
        latest
            .entry(record.spec.job.as_str())
            .and_modify(|current| {
                if record.status.start_time > current.status.start_time {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest
}

/// Decide which definitions trigger at `now`
///
/// Returns one decision per definition, in definition order.
pub fn evaluate(
    now: DateTime<Utc>,
    records: &[ExecutionRecord],
    definitions: &[PeriodicDefinition],
    cron_fired: &HashSet<String>,
) -> Vec<TriggerDecision> {
    let latest = latest_by_job(records);
    definitions
        .iter()
        .map(|definition| {
            let previous = latest.get(definition.name.as_str()).copied();
            evaluate_one(now, previous, definition, cron_fired)
        })
        .collect()
}

fn evaluate_one(
    now: DateTime<Utc>,
    latest: Option<&ExecutionRecord>,
    definition: &PeriodicDefinition,
    cron_fired: &HashSet<String>,
) -> TriggerDecision {
    let due = if definition.cron_expression().is_some() {
        if !cron_fired.contains(&definition.name) {
            // Not fired this tick: no trigger and no retry
            return TriggerDecision::skip(&definition.name);
        }
        latest.map_or(true, ExecutionRecord::is_complete)
    } else {
        latest.map_or(true, |record| interval_elapsed(now, record, definition))
    };

    let retry_count = match (latest, &definition.retry) {
        (Some(record), Some(policy)) => match evaluate_retry(policy, record, now) {
            RetryDecision::Retry(count) => Some(count),
            other => {
                debug!(job = %definition.name, decision = ?other, "Not retrying");
                None
            }
        },
        _ => None,
    };

    let reason = if latest.is_none() {
        Some(TriggerReason::NoHistory)
    } else if due {
        if definition.cron_expression().is_some() {
            Some(TriggerReason::CronFired)
        } else {
            Some(TriggerReason::IntervalElapsed)
        }
    } else if retry_count.is_some() {
        Some(TriggerReason::Retry)
    } else {
        None
    };

    TriggerDecision {
        job: definition.name.clone(),
        reason,
        retry_count,
    }
}

fn interval_elapsed(
    now: DateTime<Utc>,
    latest: &ExecutionRecord,
    definition: &PeriodicDefinition,
) -> bool {
    if !latest.is_complete() {
        return false;
    }
    match (definition.minimum_interval(), definition.interval()) {
        (Some(minimum), _) => latest
            .status
            .completion_time
            .is_some_and(|completed| now - completed > minimum),
        (None, Some(interval)) => now - latest.status.start_time > interval,
        (None, None) => false,
    }
}
