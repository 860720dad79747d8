use k8s_openapi::api::core::v1::Container;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of the desired behavior of a Someapp.
///
/// A Someapp bundles one replicated workload with an optional autoscaler, an
/// in-cluster service (api type only) and, when istio is enabled, a pair of
/// mesh traffic-steering objects. `name`, `type`, `version`, `canaryTag` and
/// `enableIstio` are immutable after creation; the admission pipeline rejects
/// writes that change them (`self == oldSelf`), so the controller treats the
/// stored values as stable.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "ops.some.cn",
    version = "v1",
    kind = "Someapp",
    plural = "someapps",
    singular = "someapp",
    namespaced,
    status = "SomeappStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SomeappSpec {
    /// Application name shared by the stable and canary Someapps of one app.
    /// All child object names derive from it.
    pub name: String,

    /// Workload flavor. Only `api` gets a service and mesh objects.
    #[serde(default, rename = "type")]
    pub app_type: AppType,

    /// Release stage of this Someapp.
    #[serde(default)]
    pub version: AppVersion,

    /// `stable`, or a canary tag such as `canary-v1.2.3`. The mesh subset
    /// name is the tag with dots replaced by dashes.
    #[serde(default = "default_canary_tag")]
    #[schemars(regex(pattern = r"^(stable|canary-v\d+\.\d+\.\d+(\.\d+)?)$"))]
    pub canary_tag: String,

    /// Image-registry pull credential name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_secret: Option<String>,

    /// Pod containers. Exactly one must be named `app`; its first port named
    /// `http`, `api` or left unnamed is the service target port.
    pub containers: Vec<Container>,

    /// `configmap-<name>` or `secret-<name>` to mount as the app config
    /// file. Other values are ignored with a log notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub some_volume: Option<String>,

    /// Autoscaler bounds as `<min>-><max>`; absent means no autoscaler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^\d+->\d+$"))]
    pub set_hpa: Option<String>,

    /// CPU utilisation percentage targeted by the autoscaler.
    #[serde(default = "default_hpa_cpu_usage")]
    pub hpa_cpu_usage: i32,

    /// Splice this app into the service mesh.
    #[serde(default)]
    pub enable_istio: bool,
}

fn default_canary_tag() -> String {
    "stable".to_string()
}

fn default_hpa_cpu_usage() -> i32 {
    100
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    Api,
    Script,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Api => "api",
            AppType::Script => "script",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AppVersion {
    #[default]
    Stable,
    Canary,
}

impl AppVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppVersion::Stable => "stable",
            AppVersion::Canary => "canary",
        }
    }
}

/// Most recently observed status of a Someapp.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SomeappStatus {
    /// Coarse lifecycle phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// The spec generation most recently reconciled to success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `Creating` and `Updating` are accepted but not yet emitted by the
/// controller.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Creating,
    Updating,
    Running,
    Error,
}

impl Someapp {
    /// The container the service target port and the config volume attach to.
    pub fn app_container(&self) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == "app")
    }
}
