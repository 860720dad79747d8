//! Converges the replicated pod workload of a Someapp.

use super::owner_reference;
use crate::controller::Context;
use crate::crd::someapp::Someapp;
use crate::error::{Error, Result};
use crate::someapp::naming::Names;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, LocalObjectReference, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::{debug, warn};

/// File name the mounted config or secret is projected as.
const VOLUME_FILE_NAME: &str = "some_config.yaml";

pub async fn reconcile(
    someapp: &Someapp,
    names: &Names,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let mut entry = api.entry(&names.workload).await?.or_insert(|| Deployment {
        metadata: ObjectMeta {
            name: Some(names.workload.clone()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        ..Deployment::default()
    });
    let deployment = entry.get_mut();
    let freshly_created = deployment.metadata.creation_timestamp.is_none();
    mutate(deployment, someapp, names, freshly_created)?;
    entry.commit(&PostParams::default()).await?;
    debug!(msg = "deployment reconciled", name = %names.workload);
    Ok(())
}

/// The selector is immutable on the platform, so it and the object labels
/// are written only when the deployment is freshly constructed. The pod
/// template is replaced on every pass.
fn mutate(
    deployment: &mut Deployment,
    someapp: &Someapp,
    names: &Names,
    freshly_created: bool,
) -> Result<()> {
    if freshly_created {
        deployment.metadata.labels = Some(names.labels.clone());
        deployment.metadata.owner_references = Some(vec![owner_reference(someapp)?]);
    }
    let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
    if freshly_created {
        spec.selector = LabelSelector {
            match_expressions: None,
            match_labels: Some(names.labels.clone()),
        };
    }

    let containers = someapp.spec.containers.clone();
    let app_index = containers
        .iter()
        .position(|c| c.name == "app")
        .ok_or_else(|| Error::InvalidSomeapp("no container named `app`".to_string()))?;

    let mut pod_spec = PodSpec {
        containers,
        ..PodSpec::default()
    };
    if let Some(secret) = &someapp.spec.image_secret {
        pod_spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: secret.clone(),
        }]);
    }

    match parse_volume(someapp.spec.some_volume.as_deref()) {
        Some(SomeVolume::ConfigMap(name)) => {
            pod_spec.volumes = Some(vec![Volume {
                name: name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            }]);
            mount(&mut pod_spec.containers[app_index], name);
        }
        Some(SomeVolume::Secret(name)) => {
            pod_spec.volumes = Some(vec![Volume {
                name: name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            }]);
            mount(&mut pod_spec.containers[app_index], name);
        }
        None => {}
    }

    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(names.labels.clone()),
            ..ObjectMeta::default()
        }),
        spec: Some(pod_spec),
    };
    Ok(())
}

fn mount(container: &mut Container, volume: String) {
    container.volume_mounts = Some(vec![VolumeMount {
        name: volume,
        read_only: Some(true),
        mount_path: format!("/app/{VOLUME_FILE_NAME}"),
        sub_path: Some(VOLUME_FILE_NAME.to_string()),
        ..VolumeMount::default()
    }]);
}

enum SomeVolume {
    ConfigMap(String),
    Secret(String),
}

fn parse_volume(some_volume: Option<&str>) -> Option<SomeVolume> {
    let value = some_volume?;
    if let Some(name) = value.strip_prefix("configmap-").filter(|n| !n.is_empty()) {
        return Some(SomeVolume::ConfigMap(name.to_string()));
    }
    if let Some(name) = value.strip_prefix("secret-").filter(|n| !n.is_empty()) {
        return Some(SomeVolume::Secret(name.to_string()));
    }
    warn!(
        msg = "unrecognised someVolume, continuing without a volume",
        some_volume = value
    );
    None
}
