use crate::error::Error;

use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

/// A reconcile pass is dominated by the sequential apiserver round-trips of
/// the child fan-out (up to five kinds plus status and finalizer writes),
/// so the histogram resolves the 50 ms to 30 s range.
const DURATION_BUCKETS: [f64; 6] = [0.05, 0.25, 1., 2.5, 10., 30.];

pub struct Metrics {
    ready: Gauge,
    reconcile_runs: Counter,
    reconcile_failures: Family<FailureLabels, Counter>,
    reconcile_duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            ready: Gauge::default(),
            reconcile_runs: Counter::default(),
            reconcile_failures: Family::default(),
            reconcile_duration: HistogramWithExemplars::new(DURATION_BUCKETS.into_iter()),
        }
    }
}

impl Metrics {
    /// Register the controller metrics to start tracking them.
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "ready",
            "1 while the controller is serving reconciles",
            self.ready.clone(),
        );
        registry.register(
            "reconcile_runs",
            "reconcile passes started",
            self.reconcile_runs.clone(),
        );
        registry.register(
            "reconcile_failures",
            "failed reconcile passes by Someapp and error kind",
            self.reconcile_failures.clone(),
        );
        registry.register_with_unit(
            "reconcile_duration",
            "duration of a full reconcile pass",
            Unit::Seconds,
            self.reconcile_duration.clone(),
        );
        self
    }

    pub fn ready_set(&self, value: i64) {
        self.ready.set(value);
    }

    /// Counts the pass and returns a guard that records its duration when
    /// the pass ends, exemplared with the trace id when one is sampled.
    pub fn reconcile_count_and_measure(&self, trace_id: &TraceId) -> DurationGuard {
        self.reconcile_runs.inc();
        DurationGuard {
            started: Instant::now(),
            exemplar: trace_id.try_into().ok(),
            histogram: self.reconcile_duration.clone(),
        }
    }

    pub fn reconcile_failure_set<K: ResourceExt>(&self, obj: &Arc<K>, error: &Error) {
        self.reconcile_failures
            .get_or_create(&FailureLabels {
                namespace: obj.namespace().unwrap_or_default(),
                instance: obj.name_any(),
                error: error.metric_label(),
            })
            .inc();
    }
}

/// Someapps are namespaced, so failures are keyed the same way the work
/// queue keys resources.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub namespace: String,
    pub instance: String,
    pub error: String,
}

/// Exemplar label linking a duration sample to its reconcile trace.
#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub trace_id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if id == &TraceId::INVALID {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self {
                trace_id: id.to_string(),
            })
        }
    }
}

/// Observes the elapsed reconcile time when dropped, so early returns and
/// error paths are measured the same as completed passes.
pub struct DurationGuard {
    started: Instant,
    exemplar: Option<TraceLabel>,
    histogram: HistogramWithExemplars<TraceLabel>,
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.histogram.observe(elapsed, self.exemplar.take());
    }
}
