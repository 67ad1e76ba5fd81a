// Cron signal source
//
// Tracks the cron-driven periodic definitions and reports which of them fired
// since the last time the trigger loop asked.

use crate::config::CronConfig;
use crate::errors::CronError;
use crate::models::PeriodicDefinition;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of cron fire signals consumed by the periodic trigger loop
#[cfg_attr(test, mockall::automock)]
pub trait CronSignalSource: Send + Sync {
    /// Reconcile tracked entries with the current definitions
    ///
    /// Valid entries are installed even when others are rejected; rejected
    /// expressions are returned as one aggregate error.
    fn sync_config(
        &self,
        definitions: &[PeriodicDefinition],
        now: DateTime<Utc>,
    ) -> Result<(), CronError>;

    /// Names of jobs whose cron fired at or before `now`, sorted
    ///
    /// Each fire is reported once; fires missed between two calls collapse
    /// into one.
    fn queued_jobs(&self, now: DateTime<Utc>) -> Vec<String>;
}

/// Parse a cron expression
///
/// Five-field expressions use standard cron day-of-week numbering (0-7, with
/// both 0 and 7 meaning Sunday); they get a zero seconds field prepended and
/// their day-of-week field renumbered. Six and seven field expressions and
/// `@hourly` style macros are passed through.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, String> {
    let expression = expression.trim();
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if !expression.starts_with('@') && fields.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            standard_day_of_week(fields[4])
        )
    } else {
        expression.to_string()
    };
    CronSchedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Rewrite a standard day-of-week field (Sunday = 0 or 7) into the 1-7,
/// Sunday = 1 numbering of the `cron` crate
///
/// Items using day names, or that cannot be read as numbers, are left as they
/// are for the parser to accept or reject.
fn standard_day_of_week(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }
    field
        .split(',')
        .map(|item| match standard_days(item) {
            Some(days) => days
                .iter()
                .map(|day| (day % 7 + 1).to_string())
                .collect::<Vec<_>>()
                .join(","),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand one list item (`*`, `n`, `a-b`, each with an optional `/step`)
/// into standard day numbers
fn standard_days(item: &str) -> Option<Vec<u32>> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step.parse::<u32>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };

    let (start, end) = if base == "*" {
        (0, 6)
    } else if let Some((start, end)) = base.split_once('-') {
        (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?)
    } else {
        let day = base.parse::<u32>().ok()?;
        // `n/step` runs from n to the end of the week
        (day, if step.is_some() { 6 } else { day })
    };
    if start > end || end > 7 {
        return None;
    }

    let mut days: Vec<u32> = (start..=end)
        .step_by(step.unwrap_or(1) as usize)
        .collect();
    days.sort_by_key(|day| day % 7);
    days.dedup_by_key(|day| *day % 7);
    Some(days)
}

struct CronEntry {
    expression: String,
    schedule: CronSchedule,
    next_fire: Option<DateTime<Utc>>,
}

impl CronEntry {
    fn next_after(&self, after: DateTime<Utc>, timezone: &Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// In-process cron tracker evaluated in a fixed timezone
pub struct CronTracker {
    timezone: Tz,
    entries: Mutex<HashMap<String, CronEntry>>,
}

impl CronTracker {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build a tracker from the `cron` configuration section
    pub fn from_config(config: &CronConfig) -> Result<Self, CronError> {
        let timezone = Tz::from_str(&config.timezone)
            .map_err(|_| CronError::InvalidTimezone(config.timezone.clone()))?;
        Ok(Self::new(timezone))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Next scheduled fire for a tracked job
    pub fn next_fire(&self, job: &str) -> Option<DateTime<Utc>> {
        self.lock_entries().get(job).and_then(|e| e.next_fire)
    }

    /// Number of tracked cron entries
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CronEntry>> {
        // Entries stay consistent even if a holder panicked
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CronSignalSource for CronTracker {
    fn sync_config(
        &self,
        definitions: &[PeriodicDefinition],
        now: DateTime<Utc>,
    ) -> Result<(), CronError> {
        let mut errors = Vec::new();
        let mut entries = self.lock_entries();

        let wanted: HashMap<&str, &str> = definitions
            .iter()
            .filter_map(|d| d.cron_expression().map(|expr| (d.name.as_str(), expr)))
            .collect();

        entries.retain(|name, _| {
            let keep = wanted.contains_key(name.as_str());
            if !keep {
                info!(job = %name, "Removing cron entry");
            }
            keep
        });

        for (name, expression) in wanted {
            if entries
                .get(name)
                .is_some_and(|existing| existing.expression == expression)
            {
                continue;
            }

            match parse_cron_expression(expression) {
                Ok(schedule) => {
                    let mut entry = CronEntry {
                        expression: expression.to_string(),
                        schedule,
                        next_fire: None,
                    };
                    entry.next_fire = entry.next_after(now, &self.timezone);
                    info!(
                        job = %name,
                        expression = %expression,
                        next_fire = ?entry.next_fire,
                        "Installing cron entry"
                    );
                    entries.insert(name.to_string(), entry);
                }
                Err(reason) => {
                    warn!(job = %name, expression = %expression, error = %reason, "Invalid cron expression");
                    // A stale entry for a now-invalid expression must not keep firing
                    entries.remove(name);
                    errors.push(CronError::InvalidExpression {
                        job: name.to_string(),
                        expression: expression.to_string(),
                        reason,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CronError::Multiple(errors))
        }
    }

    fn queued_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.lock_entries();
        let mut fired = Vec::new();

        for (name, entry) in entries.iter_mut() {
            match entry.next_fire {
                Some(next) if next <= now => {
                    entry.next_fire = entry.next_after(now, &self.timezone);
                    debug!(job = %name, next_fire = ?entry.next_fire, "Cron fired");
                    fired.push(name.clone());
                }
                _ => {}
            }
        }

        fired.sort();
        fired
    }
}
