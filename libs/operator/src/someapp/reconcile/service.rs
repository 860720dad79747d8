//! Converges the in-cluster service of an api-type Someapp.

use super::owner_reference;
use crate::controller::Context;
use crate::crd::someapp::Someapp;
use crate::error::{Error, Result};
use crate::someapp::naming::Names;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::debug;

pub async fn reconcile(
    someapp: &Someapp,
    names: &Names,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    let port = target_port(someapp)?;
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    match api.get_opt(&names.service).await? {
        None => {
            api.create(&PostParams::default(), &desired(someapp, names, namespace, port)?)
                .await?;
            debug!(msg = "service created", name = %names.service, port);
        }
        // Patch rather than replace, so annotations added out of band and
        // the immutable selector survive.
        Some(_) => {
            let patch = serde_json::json!({
                "metadata": { "labels": names.labels },
                "spec": {
                    "type": "ClusterIP",
                    "ports": [service_port(port)],
                },
            });
            api.patch(&names.service, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            debug!(msg = "service patched", name = %names.service, port);
        }
    }
    Ok(())
}

fn desired(someapp: &Someapp, names: &Names, namespace: &str, port: i32) -> Result<Service> {
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(names.service.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(names.labels.clone()),
            owner_references: Some(vec![owner_reference(someapp)?]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(names.service_selector.clone()),
            ports: Some(vec![service_port(port)]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}

fn service_port(target: i32) -> ServicePort {
    ServicePort {
        name: Some("http".to_string()),
        protocol: Some("TCP".to_string()),
        port: 80,
        target_port: Some(IntOrString::Int(target)),
        app_protocol: Some("http".to_string()),
        ..ServicePort::default()
    }
}

/// The service targets the first port of the `app` container named `http`,
/// `api` or left unnamed.
fn target_port(someapp: &Someapp) -> Result<i32> {
    let container = someapp
        .app_container()
        .ok_or_else(|| Error::InvalidSomeapp("no container named `app`".to_string()))?;
    container
        .ports
        .iter()
        .flatten()
        .find(|p| matches!(p.name.as_deref(), Some("http") | Some("api") | None))
        .map(|p| p.container_port)
        .ok_or_else(|| {
            Error::InvalidSomeapp("container `app` exposes no http, api or unnamed port".to_string())
        })
}
