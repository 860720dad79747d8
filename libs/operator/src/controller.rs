//! State shared between the controller, the reconcilers and the web server.

use crate::metrics::Metrics;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kube::client::Client;
use kube::runtime::events::{Recorder, Reporter};
use kube::Resource;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Context injected into each reconcile and error-policy invocation.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Per-resource retry delays
    pub backoff: Arc<Backoff>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "someapp-controller".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, obj: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// Per-resource exponential retry backoff: 1 s initial, doubling to a 180 s
/// cap, reset on the next successful reconcile.
#[derive(Default)]
pub struct Backoff {
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    const BASE_DELAY: Duration = Duration::from_secs(1);
    const MAX_DELAY: Duration = Duration::from_secs(180);

    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().expect("backoff lock poisoned");
        let n = attempts.entry(key.to_string()).or_insert(0);
        let delay = Self::BASE_DELAY * 2u32.saturating_pow((*n).min(8));
        *n = n.saturating_add(1);
        delay.min(Self::MAX_DELAY)
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .expect("backoff lock poisoned")
            .remove(key);
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    backoff: Arc<Backoff>,
    registry: Arc<Registry>,
}

impl State {
    /// Registers the controller metrics into the given registry and wraps it
    /// for the `/metrics` endpoint.
    pub fn new(mut registry: Registry) -> Self {
        let metrics = Arc::new(Metrics::default().register(&mut registry));
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics,
            backoff: Arc::default(),
            registry: Arc::new(registry),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Create a controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            backoff: self.backoff.clone(),
        })
    }
}
