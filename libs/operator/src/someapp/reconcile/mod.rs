//! The Someapp reconciliation coordinator.
//!
//! One pass fetches the Someapp, derives names, applies the finalizer
//! policy and fans out to the child reconcilers in fixed order:
//! workload, autoscaler, service, mesh. Any child error short-circuits the
//! pass, records `phase=Error` and surfaces to the retry queue.

pub mod deployment;
pub mod hpa;
pub mod istio;
pub mod service;

use crate::controller::Context;
use crate::crd::someapp::{AppType, Phase, Someapp, SomeappStatus};
use crate::error::{Error, Result};
use crate::someapp::naming::{self, Names, Stage};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

pub static SOMEAPP_FINALIZER: &str = "ops.some/finalizer";

/// Drift-recovery interval after a fully successful pass.
const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[instrument(skip(ctx, someapp), fields(trace_id))]
pub async fn reconcile_someapp(someapp: Arc<Someapp>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = someapp.namespace().ok_or_else(|| {
        Error::InvalidSomeapp("expected Someapp to be namespaced".to_string())
    })?;
    let name = someapp.name_any();
    let backoff_key = format!("{namespace}/{name}");
    let api: Api<Someapp> = Api::namespaced(ctx.client.clone(), &namespace);

    // The watch event may be stale; read back before acting. A Someapp gone
    // mid-flight is a normal deletion race, not an error.
    let someapp = match api.get_opt(&name).await {
        Ok(Some(current)) => Arc::new(current),
        Ok(None) => {
            debug!(msg = "Someapp gone, nothing to reconcile", %name);
            ctx.backoff.reset(&backoff_key);
            return Ok(Action::await_change());
        }
        Err(e) => {
            let recorder = ctx
                .diagnostics
                .read()
                .await
                .recorder(ctx.client.clone(), someapp.as_ref());
            if let Err(publish_err) = recorder
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "Get".to_string(),
                    note: Some(format!("failed to fetch Someapp: {e}")),
                    action: "Fetch".to_string(),
                    secondary: None,
                })
                .await
            {
                warn!(msg = "failed to publish warning event", %publish_err);
            }
            return Err(e.into());
        }
    };

    info!(msg = "reconciling Someapp", %name, %namespace);
    let names = naming::derive(&someapp)?;

    let canary_mesh = names.stage == Stage::Canary
        && someapp.spec.enable_istio
        && someapp.spec.app_type == AppType::Api;
    let deleting = someapp.meta().deletion_timestamp.is_some();
    let finalized = someapp
        .finalizers()
        .iter()
        .any(|f| f.as_str() == SOMEAPP_FINALIZER);

    if canary_mesh {
        if !deleting && !finalized {
            // installed before any mesh write so a crash cannot leak the
            // spliced route
            set_finalizers(&api, &someapp, with_finalizer(&someapp)).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }
        if deleting {
            if finalized {
                istio::teardown(&names, &ctx, &namespace).await?;
                set_finalizers(&api, &someapp, without_finalizer(&someapp)).await?;
                info!(msg = "canary mesh teardown complete", %name);
            }
            return Ok(Action::await_change());
        }
    } else if deleting {
        // children disappear through owner-reference cascade
        return Ok(Action::await_change());
    }

    match apply(&someapp, &names, &ctx, &namespace).await {
        Ok(()) => {
            patch_status(
                &api,
                &name,
                SomeappStatus {
                    phase: Some(Phase::Running),
                    observed_generation: someapp.metadata.generation,
                },
            )
            .await?;
            let recorder = ctx
                .diagnostics
                .read()
                .await
                .recorder(ctx.client.clone(), someapp.as_ref());
            if let Err(publish_err) = recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "Updated".to_string(),
                    note: Some(format!("reconciled `{name}`")),
                    action: "Reconcile".to_string(),
                    secondary: None,
                })
                .await
            {
                warn!(msg = "failed to publish event", %publish_err);
            }
            ctx.backoff.reset(&backoff_key);
            Ok(Action::requeue(DEFAULT_REQUEUE_INTERVAL))
        }
        Err(e) => {
            // best effort: the original error is the one worth surfacing
            let status = SomeappStatus {
                phase: Some(Phase::Error),
                observed_generation: someapp
                    .status
                    .as_ref()
                    .and_then(|s| s.observed_generation),
            };
            if let Err(status_err) = patch_status(&api, &name, status).await {
                warn!(msg = "failed to record error phase", %status_err);
            }
            Err(e)
        }
    }
}

/// Child fan-out in fixed order; the first error aborts the pass.
async fn apply(someapp: &Someapp, names: &Names, ctx: &Context, namespace: &str) -> Result<()> {
    deployment::reconcile(someapp, names, ctx, namespace).await?;
    if someapp.spec.set_hpa.is_some() {
        hpa::reconcile(someapp, names, ctx, namespace).await?;
    }
    if someapp.spec.app_type == AppType::Api {
        service::reconcile(someapp, names, ctx, namespace).await?;
        if someapp.spec.enable_istio {
            istio::apply(someapp, names, ctx, namespace).await?;
        }
    }
    Ok(())
}

async fn patch_status(api: &Api<Someapp>, name: &str, status: SomeappStatus) -> Result<()> {
    let patch = serde_json::json!({
        "apiVersion": Someapp::api_version(&()),
        "kind": Someapp::kind(&()),
        "status": status,
    });
    api.patch_status(
        name,
        &PatchParams::apply("someapp-operator").force(),
        &Patch::Apply(&patch),
    )
    .await?;
    Ok(())
}

/// Persist an exact finalizer list. The object's resource version rides
/// along so a concurrent metadata write turns into a conflict instead of a
/// lost update.
async fn set_finalizers(
    api: &Api<Someapp>,
    someapp: &Someapp,
    finalizers: Vec<String>,
) -> Result<()> {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = someapp.resource_version() {
        metadata["resourceVersion"] = serde_json::Value::String(rv);
    }
    let patch = serde_json::json!({ "metadata": metadata });
    api.patch(
        &someapp.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

fn with_finalizer(someapp: &Someapp) -> Vec<String> {
    let mut finalizers = someapp.finalizers().to_vec();
    finalizers.push(SOMEAPP_FINALIZER.to_string());
    finalizers
}

fn without_finalizer(someapp: &Someapp) -> Vec<String> {
    someapp
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SOMEAPP_FINALIZER)
        .cloned()
        .collect()
}

fn owner_reference(someapp: &Someapp) -> Result<OwnerReference> {
    someapp.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidSomeapp("Someapp has no uid yet; cannot own children".to_string())
    })
}
