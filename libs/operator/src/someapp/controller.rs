use crate::controller::{Context, State};
use crate::crd::istio::{DestinationRule, VirtualService};
use crate::crd::someapp::Someapp;
use crate::error::Error;
use crate::someapp::reconcile::reconcile_someapp;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::{predicates, reflector, watcher, WatchStreamExt};
use tokio::time::Duration;
use tracing::{error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

fn error_policy(someapp: Arc<Someapp>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        someapp.namespace().unwrap_or_default(),
        someapp.name_any()
    );
    warn!(msg = "failed reconciliation", %key, %error);
    ctx.metrics.reconcile_failure_set(&someapp, error);
    Action::requeue(ctx.backoff.next_delay(&key))
}

/// Initialize the someapps controller (given the crd is installed).
pub async fn run(state: State, client: Client) {
    let someapps = Api::<Someapp>::all(client.clone());
    if let Err(e) = someapps.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let (reader, writer) = reflector::store();
    // drop events that leave the generation unchanged (status and watch
    // churn); deletions bump the generation and pass through
    let someapps_stream = watcher(someapps, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    let ctx = state.to_context(client.clone());

    // one Someapp at a time: the routing object is shared between the stable
    // and canary reconciles of an app
    let config = controller::Config::default()
        .concurrency(1)
        .debounce(DEBOUNCE);

    info!(msg = "starting someapp controller");
    let someapp_controller = Controller::for_stream(someapps_stream, reader)
        .with_config(config)
        .owns(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<HorizontalPodAutoscaler>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<VirtualService>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<DestinationRule>::all(client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile_someapp, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    someapp_controller.await;
}
