use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use kube::{Client, Config};
use prometheus_client::registry::Registry;
use tower::ServiceBuilder;

/// Infers the kube `Config` from the environment (kubeconfig or in-cluster)
/// and builds a client whose HTTP stack reports request metrics into
/// `registry`.
///
/// The stack order below is dictated by kube's `ConfigExt` contract: the
/// base-uri rewrite and the optional auth layer sit directly on the TLS
/// connector, and the metrics layer wraps the lot so it observes requests
/// exactly as they leave the process.
pub async fn new_instrumented_client(registry: &mut Registry) -> kube::Result<Client> {
    let config = Config::infer().await.map_err(kube::Error::InferConfig)?;
    let connector = config.rustls_https_connector()?;
    let http = hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);
    let stack = ServiceBuilder::new()
        .layer(MetricsLayer::new(registry))
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .service(http);
    Ok(Client::new(stack, config.default_namespace))
}
