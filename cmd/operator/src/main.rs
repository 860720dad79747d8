use actix_web::web::Data;
use actix_web::{get, middleware, App, HttpResponse, HttpServer, Responder};
use clap::{crate_authors, crate_description, crate_version, Parser};
use prometheus_client::registry::Registry;
use someapp_operator::controller::State;
use someapp_operator::someapp;
use someapp_operator::telemetry::{self, LogFormat, TelemetryConfig};
use someapp_operator_k8s_util::client::new_instrumented_client;

#[derive(Parser, Debug)]
#[command(
    name = "someapp-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Port the metrics and health endpoints listen on
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,kube=debug,someapp_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env)]
    log_format: LogFormat,

    /// OpenTelemetry OTLP endpoint; trace export is disabled when unset
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Ratio of traces to sample; `1.0` samples everything
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Cap on events recorded per exported span
    #[arg(long, default_value_t = 32, env)]
    trace_max_events: u32,

    /// Cap on attributes recorded per exported span
    #[arg(long, default_value_t = 24, env)]
    trace_max_attributes: u32,
}

impl Args {
    fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_filter: self.log_filter.clone(),
            log_format: self.log_format.clone(),
            otlp_endpoint: self.tracing_url.clone(),
            sample_ratio: self.sample_ratio,
            max_events_per_span: self.trace_max_events,
            max_attributes_per_span: self.trace_max_attributes,
            ..TelemetryConfig::default()
        }
    }
}

#[get("/metrics")]
async fn metrics(state: Data<State>) -> impl Responder {
    match state.metrics() {
        Ok(body) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(body),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e:?}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.telemetry()).await?;

    let mut registry = Registry::with_prefix("someapp_operator");
    let client = new_instrumented_client(&mut registry).await?;
    let state = State::new(registry);

    let web_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(web_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(("0.0.0.0", args.port))?
    .shutdown_timeout(5)
    .run();

    // Each side shuts down gracefully on its own signal handling, so drive
    // both to completion together and surface the server's exit result.
    let (_, served) = tokio::join!(someapp::controller::run(state, client), server);
    served?;
    Ok(())
}
