//! Telemetry initialization for tracing, metrics, and structured logging
//!
//! Provides unified setup with:
//! - W3C TraceContext propagation for distributed tracing
//! - OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! - A Prometheus recorder backing the `/metrics` scrape endpoint
//! - JSON structured logging with trace context

use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::metrics;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the OTLP tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to install the Prometheus metrics recorder
    #[error("failed to install metrics recorder: {0}")]
    RecorderInit(String),

    /// Failed to initialize the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and logs
    pub service_name: String,

    /// Deployment environment label (e.g. "production")
    pub environment: String,

    /// Log filter directive (e.g. "info" or "turnstile=debug")
    pub log_filter: String,

    /// OTLP endpoint for span export; `None` disables export
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "turnstile".to_string(),
            environment: "development".to_string(),
            log_filter: "info".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Handle over initialized telemetry; flushes exporters on shutdown
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    metrics_handle: PrometheusHandle,
}

impl TelemetryGuard {
    /// The Prometheus handle rendering the `/metrics` payload
    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }

    /// Flush and shut down exporters, bounded by the given deadline.
    /// Export failures are logged, never propagated: telemetry must not
    /// affect shutdown any more than it affects decisions.
    pub async fn shutdown(self, deadline: Duration) {
        let Some(provider) = self.tracer_provider else {
            return;
        };
        let flush = tokio::task::spawn_blocking(move || {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "tracer provider shutdown failed");
            }
        });
        if tokio::time::timeout(deadline, flush).await.is_err() {
            tracing::warn!(?deadline, "telemetry flush did not complete in time");
        }
    }
}

/// Initialize telemetry with the given configuration
///
/// Sets up the W3C TraceContext propagator, the optional OTLP span
/// exporter, the Prometheus metrics recorder, and JSON structured logging.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name, &config.environment);

    // Option<Layer> implements Layer, so the OTLP layer composes directly
    let (otel_layer, tracer_provider) = if let Some(endpoint) = &config.otlp_endpoint {
        let provider = init_otlp_tracer(endpoint, resource)?;
        let tracer = provider.tracer(config.service_name.clone());
        (
            Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Some(provider),
        )
    } else {
        (None, None)
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::RecorderInit(e.to_string()))?;
    metrics::init_metrics();

    info!(
        service = %config.service_name,
        environment = %config.environment,
        otlp = config.otlp_endpoint.is_some(),
        "telemetry initialized"
    );

    Ok(TelemetryGuard {
        tracer_provider,
        metrics_handle,
    })
}

/// Build the OpenTelemetry resource with service info and K8s detection
fn build_resource(service_name: &str, environment: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new("deployment.environment", environment.to_string()),
    ];

    // K8s attributes from the Deployment downward API
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    if let Ok(node_name) = std::env::var("NODE_NAME") {
        attributes.push(KeyValue::new("k8s.node.name", node_name));
    }

    if let Some(version) = option_env!("CARGO_PKG_VERSION") {
        attributes.push(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            version.to_string(),
        ));
    }

    Resource::new(attributes)
}

/// Initialize the OTLP tracer provider
fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig {
            service_name: "test-service".to_string(),
            environment: "test".to_string(),
            log_filter: "debug".to_string(),
            otlp_endpoint: None,
        };
        assert_eq!(config.service_name, "test-service");
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_build_resource() {
        let resource = build_resource("test-service", "test");
        assert!(!resource.is_empty());
    }
}
