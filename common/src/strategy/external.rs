// Remote scheduling service strategy with a per-job TTL cache

use super::ScheduleResult;
use crate::config::ExternalStrategyConfig;
use crate::errors::StrategyError;
use crate::models::ExecutionRecord;
use crate::telemetry;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

#[derive(Debug, Serialize)]
struct ScheduleRequest<'a> {
    job: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    cluster: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    cluster: String,
    cached_at: Instant,
}

#[derive(Debug)]
struct SchedulingCache {
    entries: HashMap<String, CacheEntry>,
    last_sweep: Instant,
}

/// Asks a remote HTTP service which cluster a job should run on
///
/// Answers are cached per job name. Any failure to get an answer falls back to
/// the cluster the record already requests, so this strategy never fails a
/// reconciliation.
#[derive(Debug)]
pub struct ExternalStrategy {
    client: Client,
    url: String,
    cache_entry_ttl: Duration,
    cache_cleanup_interval: Duration,
    cache: Mutex<SchedulingCache>,
}

impl ExternalStrategy {
    pub fn new(
        url: impl Into<String>,
        cache_entry_ttl: Duration,
        cache_cleanup_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self, StrategyError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                StrategyError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            url: url.into(),
            cache_entry_ttl,
            cache_cleanup_interval,
            cache: Mutex::new(SchedulingCache {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        })
    }

    pub fn from_config(config: &ExternalStrategyConfig) -> Result<Self, StrategyError> {
        if config.url.is_empty() {
            return Err(StrategyError::InvalidConfiguration(
                "external strategy url cannot be empty".to_string(),
            ));
        }
        if config.request_timeout_seconds == 0 {
            return Err(StrategyError::InvalidConfiguration(
                "external strategy request timeout must be greater than 0".to_string(),
            ));
        }
        Self::new(
            config.url.clone(),
            Duration::from_secs(config.cache_entry_ttl_seconds),
            Duration::from_secs(config.cache_cleanup_interval_seconds),
            Duration::from_secs(config.request_timeout_seconds),
        )
    }

    /// Number of cached entries, expired or not
    pub fn cache_len(&self) -> usize {
        self.lock_cache().entries.len()
    }

    #[instrument(skip(self, record), fields(job = %record.spec.job))]
    pub async fn schedule(&self, record: &ExecutionRecord) -> Result<ScheduleResult, StrategyError> {
        let job = record.spec.job.as_str();

        if let Some(cluster) = self.cached(job) {
            debug!(cluster = %cluster, "External scheduling cache hit");
            telemetry::record_external_cache_hit();
            return Ok(ScheduleResult { cluster });
        }

        match self.request_cluster(job).await {
            Ok(cluster) => {
                self.lock_cache().entries.insert(
                    job.to_string(),
                    CacheEntry {
                        cluster: cluster.clone(),
                        cached_at: Instant::now(),
                    },
                );
                debug!(cluster = %cluster, "External scheduler assigned cluster");
                Ok(ScheduleResult { cluster })
            }
            Err(e) => {
                warn!(
                    error = %e,
                    cluster = %record.spec.cluster,
                    "External scheduler unavailable, keeping requested cluster"
                );
                telemetry::record_external_fallback();
                Ok(ScheduleResult {
                    cluster: record.spec.cluster.clone(),
                })
            }
        }
    }

    /// Fresh cached cluster for `job`, sweeping expired entries when due
    fn cached(&self, job: &str) -> Option<String> {
        let now = Instant::now();
        let mut cache = self.lock_cache();

        if now.duration_since(cache.last_sweep) >= self.cache_cleanup_interval {
            let ttl = self.cache_entry_ttl;
            let before = cache.entries.len();
            cache
                .entries
                .retain(|_, entry| now.duration_since(entry.cached_at) < ttl);
            cache.last_sweep = now;
            debug!(
                removed = before - cache.entries.len(),
                "Swept expired external scheduling cache entries"
            );
        }

        cache
            .entries
            .get(job)
            .filter(|entry| now.duration_since(entry.cached_at) < self.cache_entry_ttl)
            .map(|entry| entry.cluster.clone())
    }

    async fn request_cluster(&self, job: &str) -> Result<String, StrategyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ScheduleRequest { job })
            .send()
            .await
            .map_err(|e| StrategyError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(StrategyError::RequestFailed(format!(
                "unexpected status {}",
                status
            )));
        }

        let body: ScheduleResponse = response
            .json()
            .await
            .map_err(|e| StrategyError::RequestFailed(format!("invalid response body: {}", e)))?;
        Ok(body.cluster)
    }

    fn lock_cache(&self) -> MutexGuard<'_, SchedulingCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionState, PeriodicDefinition};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(job: &str, cluster: &str) -> ExecutionRecord {
        let mut definition = PeriodicDefinition::with_interval(job, 60);
        definition.cluster = cluster.to_string();
        ExecutionRecord::new_periodic(
            &definition,
            "ci",
            ExecutionState::Scheduling,
            Utc::now(),
            &BTreeMap::new(),
        )
    }

    fn strategy(server: &MockServer, ttl: Duration, cleanup: Duration) -> ExternalStrategy {
        ExternalStrategy::new(
            format!("{}/schedule", server.uri()),
            ttl,
            cleanup,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/schedule"))
            .and(body_json(json!({"job": "nightly"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cluster": "build-7"})))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_secs(60), Duration::from_secs(600));
        let record = record("nightly", "default");

        assert_eq!(strategy.schedule(&record).await.unwrap().cluster, "build-7");
        assert_eq!(strategy.schedule(&record).await.unwrap().cluster, "build-7");
        assert_eq!(record.spec.cluster, "default");
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/schedule"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cluster": "build-7"})))
            .expect(2)
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_millis(50), Duration::from_secs(600));
        let record = record("nightly", "default");

        strategy.schedule(&record).await.unwrap();
        strategy.schedule(&record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(strategy.schedule(&record).await.unwrap().cluster, "build-7");
    }

    #[tokio::test]
    async fn test_server_error_falls_back_and_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_secs(60), Duration::from_secs(600));
        let record = record("nightly", "build-1");

        assert_eq!(strategy.schedule(&record).await.unwrap().cluster, "build-1");
        assert_eq!(strategy.schedule(&record).await.unwrap().cluster, "build-1");
        assert_eq!(strategy.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_non_200_success_status_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"cluster": "build-7"})))
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_secs(60), Duration::from_secs(600));
        let result = strategy.schedule(&record("nightly", "build-1")).await.unwrap();
        assert_eq!(result.cluster, "build-1");
    }

    #[tokio::test]
    async fn test_malformed_body_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_secs(60), Duration::from_secs(600));
        let result = strategy.schedule(&record("nightly", "build-1")).await.unwrap();
        assert_eq!(result.cluster, "build-1");
    }

    #[tokio::test]
    async fn test_slow_server_hits_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"cluster": "build-7"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let strategy = ExternalStrategy::new(
            format!("{}/schedule", server.uri()),
            Duration::from_secs(60),
            Duration::from_secs(600),
            Duration::from_millis(100),
        )
        .unwrap();
        let result = strategy.schedule(&record("nightly", "build-1")).await.unwrap();
        assert_eq!(result.cluster, "build-1");
    }

    #[tokio::test]
    async fn test_unreachable_server_falls_back() {
        let strategy = ExternalStrategy::new(
            "http://127.0.0.1:1/schedule",
            Duration::from_secs(60),
            Duration::from_secs(600),
            Duration::from_secs(1),
        )
        .unwrap();
        let result = strategy.schedule(&record("nightly", "build-1")).await.unwrap();
        assert_eq!(result.cluster, "build-1");
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries_of_other_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cluster": "build-7"})))
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_millis(50), Duration::from_millis(50));
        strategy.schedule(&record("a", "default")).await.unwrap();
        strategy.schedule(&record("b", "default")).await.unwrap();
        assert_eq!(strategy.cache_len(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        strategy.schedule(&record("c", "default")).await.unwrap();
        // "a" and "b" were swept, "c" was cached after the sweep
        assert_eq!(strategy.cache_len(), 1);
    }

    #[test]
    fn test_from_config_rejects_empty_url() {
        let config = ExternalStrategyConfig {
            url: String::new(),
            cache_entry_ttl_seconds: 60,
            cache_cleanup_interval_seconds: 600,
            request_timeout_seconds: 5,
        };
        assert!(matches!(
            ExternalStrategy::from_config(&config),
            Err(StrategyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_zero_request_timeout() {
        let config = ExternalStrategyConfig {
            url: "http://scheduler.local/schedule".to_string(),
            cache_entry_ttl_seconds: 60,
            cache_cleanup_interval_seconds: 600,
            request_timeout_seconds: 0,
        };
        assert!(matches!(
            ExternalStrategy::from_config(&config),
            Err(StrategyError::InvalidConfiguration(_))
        ));
    }
}
