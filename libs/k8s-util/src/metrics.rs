//! A tower layer that measures every request the kube client makes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FutureExt;
use http::Request;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tower::{Layer, Service};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct RequestLabels {
    pub method: String,
    pub endpoint: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct StatusCodeLabel {
    pub status_code: String,
}

pub struct MetricsLayer {
    request_duration: Family<RequestLabels, Histogram>,
    requests_total: Family<StatusCodeLabel, Counter>,
}

impl MetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let request_duration = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1., 5.].into_iter())
        });
        let requests_total = Family::<StatusCodeLabel, Counter>::default();

        registry.register(
            "kubernetes_client_http_request_duration_seconds",
            "Latency of the Kubernetes client's requests by method and endpoint.",
            request_duration.clone(),
        );
        registry.register(
            "kubernetes_client_http_requests_total",
            "Total number of the Kubernetes client's requests by status code.",
            requests_total.clone(),
        );

        Self {
            request_duration,
            requests_total,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            request_duration: self.request_duration.clone(),
            requests_total: self.requests_total.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    request_duration: Family<RequestLabels, Histogram>,
    requests_total: Family<StatusCodeLabel, Counter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let labels = RequestLabels {
            method: req.method().to_string(),
            endpoint: url_escape::encode_path(&template_path(req.uri().path())).to_string(),
        };
        let start_time = Instant::now();

        let fut = self.inner.call(req);
        let request_duration = self.request_duration.clone();
        let requests_total = self.requests_total.clone();
        async move {
            let result = fut.await;
            let duration = start_time.elapsed().as_secs_f64();
            request_duration.get_or_create(&labels).observe(duration);
            if let Ok(ref response) = result {
                let status_code = response.status().as_u16().to_string();
                requests_total
                    .get_or_create(&StatusCodeLabel { status_code })
                    .inc();
            }
            result
        }
        .boxed()
    }
}

/// Collapses object names out of an apiserver path so that label
/// cardinality stays bounded, e.g.
/// `/apis/apps/v1/namespaces/prod/deployments/web` becomes
/// `/apis/apps/v1/namespaces/{namespace}/deployments/{name}`.
fn template_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let skip = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return "/{other}".to_string(),
    };
    if segments.len() <= skip {
        return path.to_string();
    }

    let mut out: Vec<String> = segments.iter().take(skip).map(|s| s.to_string()).collect();
    let mut rest = &segments[skip..];
    if rest.first() == Some(&"namespaces") {
        out.push("namespaces".to_string());
        if rest.len() > 1 {
            out.push("{namespace}".to_string());
        }
        rest = if rest.len() > 1 { &rest[2..] } else { &[] };
    }
    if let Some(resource) = rest.first() {
        out.push(resource.to_string());
    }
    if rest.len() > 1 {
        out.push("{name}".to_string());
    }
    if rest.len() > 2 {
        // subresource such as status or finalizers
        out.push(rest[2].to_string());
    }
    format!("/{}", out.join("/"))
}
