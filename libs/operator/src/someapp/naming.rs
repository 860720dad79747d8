//! Pure derivation of child-object names and labels from a Someapp.
//!
//! Everything the reconcilers stamp on children comes from here, so the
//! whole naming scheme is unit-testable without a cluster.

use crate::crd::someapp::{AppType, AppVersion, Someapp};
use crate::error::{Error, Result};

use std::collections::BTreeMap;

use kube::ResourceExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Stable,
    Canary,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stable => "stable",
            Stage::Canary => "canary",
        }
    }
}

/// Names and labels for every child object of one Someapp.
#[derive(Clone, Debug, PartialEq)]
pub struct Names {
    pub app: String,
    pub stage: Stage,
    /// Mesh subset name: the canary tag with dots replaced by dashes.
    pub subset: String,
    pub workload: String,
    pub autoscaler: String,
    pub service: String,
    /// The routing object is shared by the stable and canary Someapps.
    pub routing: String,
    pub subset_rule: String,
    pub stable_route: String,
    pub canary_route: String,
    pub service_host: String,
    pub canary_host: String,
    /// Standard labels stamped on every child.
    pub labels: BTreeMap<String, String>,
    /// Pod selector labels of the in-cluster service.
    pub service_selector: BTreeMap<String, String>,
}

pub fn derive(someapp: &Someapp) -> Result<Names> {
    let namespace = someapp.namespace().ok_or_else(|| {
        Error::InvalidSomeapp("expected Someapp to be namespaced".to_string())
    })?;
    let resource_name = someapp.name_any();
    let spec = &someapp.spec;
    let app = spec.name.clone();

    let stage = match spec.version {
        AppVersion::Stable => Stage::Stable,
        AppVersion::Canary => Stage::Canary,
    };
    let subset = spec.canary_tag.replace('.', "-");

    let workload = match (spec.app_type, stage) {
        (AppType::Script, _) => format!("{app}-{resource_name}"),
        (AppType::Api, Stage::Stable) => app.clone(),
        (AppType::Api, Stage::Canary) => format!("{app}-{subset}"),
    };

    let service = match stage {
        Stage::Stable => app.clone(),
        Stage::Canary => format!("{app}-canary"),
    };
    let subset_rule = match stage {
        Stage::Stable => app.clone(),
        Stage::Canary => format!("{app}-canary"),
    };

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.clone());
    labels.insert("name".to_string(), resource_name);
    labels.insert("type".to_string(), spec.app_type.as_str().to_string());
    labels.insert("version".to_string(), spec.version.as_str().to_string());
    labels.insert("stage".to_string(), stage.as_str().to_string());

    let mut service_selector = BTreeMap::new();
    service_selector.insert("type".to_string(), spec.app_type.as_str().to_string());
    service_selector.insert("app".to_string(), app.clone());
    service_selector.insert("stage".to_string(), stage.as_str().to_string());

    Ok(Names {
        autoscaler: workload.clone(),
        routing: app.clone(),
        stable_route: format!("{app}-stable"),
        canary_route: format!("{app}-{subset}"),
        service_host: format!("{app}.{namespace}.svc.cluster.local"),
        canary_host: format!("{app}-canary.{namespace}.svc.cluster.local"),
        app,
        stage,
        subset,
        workload,
        service,
        subset_rule,
        labels,
        service_selector,
    })
}
