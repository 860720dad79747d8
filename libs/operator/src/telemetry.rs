use std::time::Duration;

use opentelemetry::trace::{TraceError, TraceId, TracerProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::Resource;
use serde::Serialize;
use thiserror::Error;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

const SERVICE_NAME: &str = "someapp-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("TraceError: {0}")]
    TraceError(#[source] TraceError),

    #[error("SetGlobalDefaultError: {0}")]
    SetGlobalDefaultError(#[source] SetGlobalDefaultError),
}

/// Fetches the `TraceId` of the current [`tracing::Span`] through its
/// [`opentelemetry::Context`]. Returns `TraceId::INVALID` when the span is
/// not sampled.
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Log output format.
#[derive(clap::ValueEnum, Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Telemetry settings, assembled from the command line by the operator
/// binary.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Directive for `tracing_subscriber::filter::EnvFilter`.
    pub log_filter: String,
    pub log_format: LogFormat,
    /// OTLP gRPC endpoint; trace export is disabled when unset.
    pub otlp_endpoint: Option<String>,
    /// Ratio of reconcile traces to sample.
    pub sample_ratio: f64,
    /// Cap on events recorded per exported span. Reconcile spans log one
    /// line per child write, so the cap bounds pathological retry loops.
    pub max_events_per_span: u32,
    /// Cap on attributes recorded per exported span.
    pub max_attributes_per_span: u32,
    /// Deadline for one OTLP export batch.
    pub export_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
            otlp_endpoint: None,
            sample_ratio: 0.1,
            max_events_per_span: 32,
            max_attributes_per_span: 24,
            export_timeout: Duration::from_secs(5),
        }
    }
}

/// Initializes logging and, when an OTLP endpoint is configured, trace
/// export sampled at the configured ratio.
///
/// ```no_run
/// # use someapp_operator::telemetry::{init, TelemetryConfig};
/// #
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// init(TelemetryConfig {
///     otlp_endpoint: std::env::var("OPENTELEMETRY_ENDPOINT_URL").ok(),
///     ..TelemetryConfig::default()
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn init(config: TelemetryConfig) -> Result<(), Error> {
    let logger = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().compact().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let filter = EnvFilter::new(&config.log_filter);
    let collector = Registry::default().with(logger).with(filter);

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let telemetry = OpenTelemetryLayer::new(otlp_tracer(endpoint, &config)?);
            tracing::subscriber::set_global_default(collector.with(telemetry))
                .map_err(Error::SetGlobalDefaultError)
        }
        None => {
            tracing::subscriber::set_global_default(collector).map_err(Error::SetGlobalDefaultError)
        }
    }
}

fn otlp_tracer(endpoint: &str, config: &TelemetryConfig) -> Result<Tracer, Error> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_timeout(config.export_timeout);
    let trace_config = trace::Config::default()
        .with_sampler(Sampler::TraceIdRatioBased(config.sample_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_max_events_per_span(config.max_events_per_span)
        .with_max_attributes_per_span(config.max_attributes_per_span)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]));
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(Error::TraceError)?;
    Ok(provider
        .tracer_builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build())
}
