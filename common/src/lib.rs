// Common library shared by the scheduler and worker binaries

pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod reconciler;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod telemetry;
