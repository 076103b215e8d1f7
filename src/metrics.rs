use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
}

pub struct MetricsExporterConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

pub fn init_metrics(
    service_name: String,
    exporter: MetricsExporterConfig,
) -> Result<Metrics, String> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(exporter.endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_millis(exporter.timeout_ms))
        .build()
        .map_err(|e| format!("metrics exporter init error: {}", e))?;

    let reader = PeriodicReader::builder(exporter).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(build_instruments())
}

pub fn init_metrics_noop() -> Metrics {
    build_instruments()
}

fn build_instruments() -> Metrics {
    let meter = opentelemetry::global::meter("llm-gateway");
    let requests = meter
        .u64_counter("gateway.requests")
        .with_description("Total requests")
        .build();
    let errors = meter
        .u64_counter("gateway.errors")
        .with_description("Total errors")
        .build();
    let latency_ms = meter
        .f64_histogram("gateway.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();

    Metrics {
        requests,
        errors,
        latency_ms,
    }
}
