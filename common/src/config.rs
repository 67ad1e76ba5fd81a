// Configuration management with layered configuration (file, env)

use crate::models::PeriodicDefinition;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub strategy: StrategyConfig,
    pub cron: CronConfig,
    pub observability: ObservabilityConfig,
    pub periodics: Vec<PeriodicDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/ci_orchestrator".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_seconds: 30,
        }
    }
}

/// Periodic trigger loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
    /// Namespace new records are created in
    pub namespace: String,
    /// Create records in the scheduling state so the reconciler places them
    pub scheduling_enabled: bool,
    /// How often to re-read configuration files, 0 disables reloading
    pub config_reload_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
            namespace: "default".to_string(),
            scheduling_enabled: false,
            config_reload_seconds: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

/// Cluster scheduling reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub resync_interval_seconds: u64,
    pub reconcile_timeout_seconds: u64,
    pub requeue_base_delay_ms: u64,
    pub requeue_max_delay_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            resync_interval_seconds: 300,
            reconcile_timeout_seconds: 30,
            requeue_base_delay_ms: 5,
            requeue_max_delay_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Passthrough,
    Failover,
    External,
}

/// Scheduling strategy selection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Cluster to alternate cluster mapping used by the failover strategy
    pub failover: HashMap<String, String>,
    pub external: Option<ExternalStrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStrategyConfig {
    pub url: String,
    #[serde(default = "default_cache_entry_ttl")]
    pub cache_entry_ttl_seconds: u64,
    #[serde(default = "default_cache_cleanup_interval")]
    pub cache_cleanup_interval_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_cache_entry_ttl() -> u64 {
    3600
}

fn default_cache_cleanup_interval() -> u64 {
    600
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// IANA timezone cron expressions are evaluated in
    pub timezone: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.scheduler.tick_interval_seconds == 0 {
            return Err("Scheduler tick_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.namespace.is_empty() {
            return Err("Scheduler namespace cannot be empty".to_string());
        }

        if self.worker.concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }
        if self.worker.reconcile_timeout_seconds == 0 {
            return Err("Worker reconcile_timeout_seconds must be greater than 0".to_string());
        }

        if self.strategy.kind == StrategyKind::External {
            let external = match &self.strategy.external {
                Some(external) if !external.url.is_empty() => external,
                _ => {
                    return Err(
                        "External strategy requires strategy.external.url to be set".to_string()
                    )
                }
            };
            // A request that outlives the reconcile deadline cannot fall back
            if external.request_timeout_seconds == 0
                || external.request_timeout_seconds >= self.worker.reconcile_timeout_seconds
            {
                return Err(format!(
                    "External strategy request_timeout_seconds must be greater than 0 and less than worker reconcile_timeout_seconds ({})",
                    self.worker.reconcile_timeout_seconds
                ));
            }
        }

        if chrono_tz::Tz::from_str(&self.cron.timezone).is_err() {
            return Err(format!("Invalid cron timezone: {}", self.cron.timezone));
        }

        let mut names = HashSet::new();
        for periodic in &self.periodics {
            if periodic.name.is_empty() {
                return Err("Periodic job name cannot be empty".to_string());
            }
            if !names.insert(periodic.name.as_str()) {
                return Err(format!("Duplicate periodic job name: {}", periodic.name));
            }
            let schedules = [
                periodic.cron_expression().is_some(),
                periodic.interval_seconds.is_some(),
                periodic.minimum_interval_seconds.is_some(),
            ]
            .iter()
            .filter(|set| **set)
            .count();
            if schedules != 1 {
                return Err(format!(
                    "Periodic job {} must set exactly one of cron, interval_seconds, minimum_interval_seconds",
                    periodic.name
                ));
            }
        }

        Ok(())
    }
}

/// Supplies an immutable configuration snapshot to each tick
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Arc<Settings>;
}

/// Fixed configuration snapshot
#[derive(Debug, Clone)]
pub struct StaticConfig(Arc<Settings>);

impl StaticConfig {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(settings))
    }
}

impl ConfigProvider for StaticConfig {
    fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.0)
    }
}

/// Configuration snapshot that can be replaced while the process runs
#[derive(Debug, Clone)]
pub struct WatchedConfig {
    rx: watch::Receiver<Arc<Settings>>,
}

impl WatchedConfig {
    /// Create the provider and the sender used to publish new snapshots
    pub fn new(initial: Settings) -> (Self, watch::Sender<Arc<Settings>>) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Self { rx }, tx)
    }
}

impl ConfigProvider for WatchedConfig {
    fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.rx.borrow())
    }
}

/// Re-read configuration files on an interval and publish valid snapshots
///
/// Invalid configuration is logged and ignored; the previous snapshot stays
/// in effect.
pub async fn reload_loop(
    config_dir: PathBuf,
    every: Duration,
    tx: watch::Sender<Arc<Settings>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately and the initial snapshot is already loaded
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let loaded = Settings::load_from_path(&config_dir)
                    .map_err(|e| e.to_string())
                    .and_then(|settings| settings.validate().map(|()| settings));
                match loaded {
                    Ok(settings) => {
                        debug!(periodics = settings.periodics.len(), "Configuration reloaded");
                        if tx.send(Arc::new(settings)).is_err() {
                            info!("No configuration consumers left, stopping reload loop");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Ignoring invalid configuration reload");
                    }
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }
}
