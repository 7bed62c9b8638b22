// Telemetry module for structured logging, metrics, and tracing

use crate::connection::classifier::FailureRecord;
use crate::models::{ProfilePublicInfo, Topology};
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
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

const SERVICE_NAME: &str = "redis-connector";

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from configuration or environment
/// - Optional OpenTelemetry integration
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

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
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
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

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - redis_connections_created_total: Counter of established connections by topology
/// - redis_connection_failures_total: Counter of failed acquisitions by failure kind
/// - redis_connections_reclaimed_total: Counter of connections closed by the idle sweep
/// - redis_connection_registry_size: Gauge of pooled entries
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
        "redis_connections_created_total",
        "Total number of Redis connections established"
    );
    describe_counter!(
        "redis_connection_failures_total",
        "Total number of failed connection attempts"
    );
    describe_counter!(
        "redis_connections_reclaimed_total",
        "Total number of idle connections closed by the reclaimer"
    );
    describe_gauge!(
        "redis_connection_registry_size",
        "Current number of entries in the connection registry"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_connection_created(topology: Topology) {
    counter!("redis_connections_created_total", "topology" => topology.as_str()).increment(1);
}

#[inline]
pub fn record_connection_failure(kind: &'static str) {
    counter!("redis_connection_failures_total", "kind" => kind).increment(1);
}

#[inline]
pub fn record_connections_reclaimed(count: u64) {
    counter!("redis_connections_reclaimed_total").increment(count);
}

#[inline]
pub fn record_registry_size(size: usize) {
    gauge!("redis_connection_registry_size").set(size as f64);
}

/// Sink for connection lifecycle events.
///
/// Called inline on the acquisition path, so implementations must not block.
pub trait ConnectionTelemetry: Send + Sync {
    fn report_connection_failure(&self, profile: &ProfilePublicInfo, failure: &FailureRecord);

    fn report_connection_established(&self, profile: &ProfilePublicInfo, topology: Topology);
}

/// Default sink: structured log events plus Prometheus counters
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl ConnectionTelemetry for MetricsTelemetry {
    fn report_connection_failure(&self, profile: &ProfilePublicInfo, failure: &FailureRecord) {
        record_connection_failure(failure.kind.label());
        tracing::warn!(
            database_id = %profile.id,
            database_name = %profile.name,
            host = %profile.host,
            port = profile.port,
            kind = failure.kind.label(),
            cause = %failure.cause,
            "Connection failed"
        );
    }

    fn report_connection_established(&self, profile: &ProfilePublicInfo, topology: Topology) {
        record_connection_created(topology);
        tracing::info!(
            database_id = %profile.id,
            host = %profile.host,
            port = profile.port,
            topology = %topology,
            "Connection established"
        );
    }
}
