// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "ci-orchestrator";

/// Initialize structured logging with JSON formatting and trace context
///
/// `RUST_LOG` takes precedence over the configured level. When a tracing
/// endpoint is given, spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(log_level)?,
    };

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Filter built from the configured log level directives
fn level_filter(log_level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(log_level)
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", log_level, e))
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus exporter and describe every metric
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "periodic_records_created_total",
        "Execution records created by the periodic trigger loop"
    );
    describe_counter!(
        "periodic_create_failures_total",
        "Failed attempts to create periodic execution records"
    );
    describe_counter!(
        "periodic_retries_total",
        "Periodic records created as retries of a previous run"
    );
    describe_histogram!(
        "trigger_tick_duration_seconds",
        "Duration of one periodic trigger tick in seconds"
    );
    describe_counter!(
        "scheduling_decisions_total",
        "Cluster placement decisions by strategy and outcome"
    );
    describe_counter!("reconcile_errors_total", "Failed reconciliations");
    describe_gauge!(
        "reconcile_queue_depth",
        "Records waiting in the reconcile work queue"
    );
    describe_counter!(
        "external_scheduler_cache_hits_total",
        "External scheduler lookups served from cache"
    );
    describe_counter!(
        "external_scheduler_fallbacks_total",
        "External scheduler lookups that fell back to the requested cluster"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_periodic_created(job: &str, retry: bool) {
    counter!("periodic_records_created_total", "job" => job.to_string()).increment(1);
    if retry {
        counter!("periodic_retries_total", "job" => job.to_string()).increment(1);
    }
}

#[inline]
pub fn record_periodic_create_failure(job: &str) {
    counter!("periodic_create_failures_total", "job" => job.to_string()).increment(1);
}

#[inline]
pub fn record_tick_duration(duration_seconds: f64) {
    histogram!("trigger_tick_duration_seconds").record(duration_seconds);
}

/// Record a placement decision; `outcome` is `scheduled`, `skipped` or `failed`
///
/// `skipped` covers records that were gone or no longer scheduling.
#[inline]
pub fn record_scheduling_decision(strategy: &'static str, outcome: &'static str) {
    counter!("scheduling_decisions_total", "strategy" => strategy, "outcome" => outcome)
        .increment(1);
}

#[inline]
pub fn record_reconcile_error() {
    counter!("reconcile_errors_total").increment(1);
}

#[inline]
pub fn update_reconcile_queue_depth(depth: usize) {
    gauge!("reconcile_queue_depth").set(depth as f64);
}

#[inline]
pub fn record_external_cache_hit() {
    counter!("external_scheduler_cache_hits_total").increment(1);
}

#[inline]
pub fn record_external_fallback() {
    counter!("external_scheduler_fallbacks_total").increment(1);
}
