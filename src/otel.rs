use std::{env, time::Duration};

use opentelemetry::{global, trace::TraceContextExt, Context, KeyValue};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, TracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::SERVICE_NAME;

/// Flushes pending spans when the server exits.
pub struct TracerGuard {
    provider: TracerProvider,
}

impl TracerGuard {
    pub fn new(provider: TracerProvider) -> Self {
        Self { provider }
    }
}

impl Drop for TracerGuard {
    fn drop(&mut self) {
        tracing::info!("flushing spans");
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "tracer shutdown");
        }
    }
}

#[derive(Debug, PartialEq)]
enum Exporter {
    Disabled,
    Stdout,
    Otlp(String),
}

impl Exporter {
    fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => Exporter::Disabled,
            Some("stdout") => Exporter::Stdout,
            Some(url) => Exporter::Otlp(url.to_string()),
        }
    }
}

fn sampling_rate(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(1.0)
}

/// Installs the global propagator and tracer provider.
///
/// `OTEL_EXPORTER_OTLP_ENDPOINT` picks the exporter: unset for none, `stdout`,
/// or an OTLP HTTP url. `OTEL_SAMPLING_RATE` applies to OTLP only.
pub fn init_tracer() -> anyhow::Result<(TracerProvider, String)> {
    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string());
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let rate = sampling_rate(env::var("OTEL_SAMPLING_RATE").ok().as_deref());

    global::set_text_map_propagator(TraceContextPropagator::new());

    let (tracer_provider, info) = match Exporter::from_endpoint(endpoint.as_deref()) {
        Exporter::Disabled => (
            TracerProvider::builder()
                .with_config(trace::Config::default())
                .build(),
            "No OTLP endpoint".to_owned(),
        ),
        Exporter::Stdout => (
            TracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .build(),
            "OTLP stdout exporter".to_owned(),
        ),
        Exporter::Otlp(url) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(&url)
                .with_timeout(Duration::from_secs(5));
            let provider = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(
                    trace::Config::default()
                        .with_sampler(trace::Sampler::TraceIdRatioBased(rate))
                        .with_resource(opentelemetry_sdk::Resource::new(vec![KeyValue::new(
                            "service.name",
                            service_name,
                        )])),
                )
                .install_batch(runtime::Tokio)?;
            (provider, format!("OTLP endpoint: {url}, sampling: {rate}"))
        }
    };

    global::set_tracer_provider(tracer_provider.clone());

    Ok((tracer_provider, info))
}

/// Span for one HTTP request, parented to the caller's `traceparent` when present.
pub fn make_span(method: &http::Method, path: &str, headers: &http::HeaderMap) -> tracing::Span {
    let cx = extract_context_from_request(headers);
    let trace_id = cx.span().span_context().trace_id().to_string();
    let res = tracing::info_span!(
        "request",
        otel.kind = "server",
        method = %method,
        path,
        trace_id,
    );
    res.set_parent(cx);
    res
}

fn extract_context_from_request(headers: &http::HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}
