// Periodic trigger loop: decides when periodic jobs get a new execution record

pub mod engine;
pub mod trigger;

pub use engine::{Scheduler, SchedulerEngine, TickReport};
pub use trigger::{evaluate, latest_by_job, TriggerDecision, TriggerReason};
