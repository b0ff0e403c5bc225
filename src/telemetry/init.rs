use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

struct OtelProviders {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

/// Keeps the OpenTelemetry providers alive until the run finishes.
pub struct TelemetryGuard {
    providers: Option<OtelProviders>,
}

impl TelemetryGuard {
    /// Flushes pending spans, metrics and logs.
    pub fn shutdown(self) {
        let Some(providers) = self.providers else {
            return;
        };
        if let Err(e) = providers.tracer.shutdown() {
            eprintln!("failed to shut down tracer provider: {e}");
        }
        if let Err(e) = providers.meter.shutdown() {
            eprintln!("failed to shut down meter provider: {e}");
        }
        if let Err(e) = providers.logger.shutdown() {
            eprintln!("failed to shut down logger provider: {e}");
        }
    }
}

fn build_providers(config: &TelemetryConfig, endpoint: &str) -> anyhow::Result<OtelProviders> {
    let resource = Resource::builder()
        .with_service_name(config.otel_service_name.clone())
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new(
            "deployment.environment",
            config.environment.clone(),
        ))
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource.clone())
        .build();

    global::set_tracer_provider(tracer.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource.clone())
        .build();

    global::set_meter_provider(meter.clone());

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(resource)
        .build();

    Ok(OtelProviders {
        tracer,
        meter,
        logger,
    })
}

/// Installs the global subscriber: console output, the run log file and,
/// when an OTLP endpoint is configured, trace/metric/log export.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)?;

    let providers = match config.otel_exporter_endpoint.as_deref() {
        Some(endpoint) => Some(build_providers(config, endpoint)?),
        None => None,
    };

    let trace_layer = providers.as_ref().map(|p| {
        OpenTelemetryLayer::new(p.tracer.tracer(config.otel_service_name.clone()))
    });
    let log_bridge = providers
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(&p.logger));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tiberius=warn,reqwest=warn,hyper=warn,h2=warn,tonic=warn")
    });

    let console_layer = if config.is_production() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().pretty().boxed()
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(log_file))
        .boxed();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(trace_layer)
        .with(log_bridge)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        service = %config.otel_service_name,
        endpoint = config.otel_exporter_endpoint.as_deref().unwrap_or("disabled"),
        log_file = %config.log_file.display(),
        "Telemetry initialized"
    );

    Ok(TelemetryGuard { providers })
}
