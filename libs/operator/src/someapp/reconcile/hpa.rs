//! Converges the horizontal autoscaler targeting the workload.

use super::owner_reference;
use crate::controller::Context;
use crate::crd::someapp::Someapp;
use crate::error::Result;
use crate::someapp::naming::Names;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
    MetricTarget, ResourceMetricSource,
};
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::debug;

pub async fn reconcile(
    someapp: &Someapp,
    names: &Names,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    let (min, max) = parse_bounds(someapp.spec.set_hpa.as_deref().unwrap_or_default());
    let api: Api<HorizontalPodAutoscaler> = Api::namespaced(ctx.client.clone(), namespace);
    let mut entry = api
        .entry(&names.autoscaler)
        .await?
        .or_insert(|| HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some(names.autoscaler.clone()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            ..HorizontalPodAutoscaler::default()
        });
    let hpa = entry.get_mut();
    if hpa.metadata.creation_timestamp.is_none() {
        hpa.metadata.labels = Some(names.labels.clone());
        hpa.metadata.owner_references = Some(vec![owner_reference(someapp)?]);
    }
    // the spec is rewritten on every pass
    hpa.spec = Some(HorizontalPodAutoscalerSpec {
        min_replicas: Some(min),
        max_replicas: max,
        scale_target_ref: CrossVersionObjectReference {
            api_version: Some("apps/v1".to_string()),
            kind: "Deployment".to_string(),
            name: names.autoscaler.clone(),
        },
        metrics: Some(vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(someapp.spec.hpa_cpu_usage),
                    ..MetricTarget::default()
                },
            }),
            ..MetricSpec::default()
        }]),
        ..HorizontalPodAutoscalerSpec::default()
    });
    entry.commit(&PostParams::default()).await?;
    debug!(msg = "hpa reconciled", name = %names.autoscaler, min, max);
    Ok(())
}

/// Parse `<min>-><max>`, swapping when the bounds arrive reversed. Anything
/// unparsable yields (0, 0), which the platform rejects and thereby surfaces
/// to the retry queue.
fn parse_bounds(set_hpa: &str) -> (i32, i32) {
    let mut parts = set_hpa.splitn(2, "->");
    let min = parts.next().and_then(|n| n.trim().parse::<i32>().ok());
    let max = parts.next().and_then(|n| n.trim().parse::<i32>().ok());
    match (min, max) {
        (Some(min), Some(max)) if min > max => (max, min),
        (Some(min), Some(max)) => (min, max),
        _ => (0, 0),
    }
}
