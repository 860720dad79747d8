//! Converges the mesh routing object and subset-rule object.
//!
//! The routing object is shared: the stable Someapp owns its skeleton and
//! the `app-stable` entry, while canary Someapps splice their own entry in
//! and remove it again at teardown. Every read-modify-write goes through
//! the object's resource version, so a concurrent writer turns into a
//! conflict error and the retry queue re-enters with a fresh read.

use super::owner_reference;
use crate::controller::Context;
use crate::crd::istio::{
    Destination, DestinationRule, DestinationRuleSpec, HttpRoute, HttpRouteDestination, Subset,
    VirtualService, VirtualServiceSpec,
};
use crate::crd::someapp::Someapp;
use crate::error::{Error, Result};
use crate::someapp::naming::{Names, Stage};

use std::collections::BTreeMap;

use kube::api::entry::Entry;
use kube::api::{Api, PostParams};
use kube::Resource;
use tracing::{debug, info};

pub async fn apply(
    someapp: &Someapp,
    names: &Names,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    match names.stage {
        Stage::Stable => apply_stable(someapp, names, ctx, namespace).await,
        Stage::Canary => apply_canary(names, ctx, namespace).await,
    }
}

async fn apply_stable(
    someapp: &Someapp,
    names: &Names,
    ctx: &Context,
    namespace: &str,
) -> Result<()> {
    let dr_api: Api<DestinationRule> = Api::namespaced(ctx.client.clone(), namespace);
    let mut entry = dr_api.entry(&names.subset_rule).await?.or_insert(|| {
        DestinationRule::new(&names.subset_rule, DestinationRuleSpec::default())
    });
    let dr = entry.get_mut();
    if dr.metadata.creation_timestamp.is_none() {
        dr.metadata.labels = Some(names.labels.clone());
        dr.metadata.owner_references = Some(vec![owner_reference(someapp)?]);
    }
    dr.spec = DestinationRuleSpec {
        host: names.service_host.clone(),
        subsets: vec![stable_subset()],
    };
    entry.commit(&PostParams::default()).await?;
    debug!(msg = "destination rule reconciled", name = %names.subset_rule);

    let vs_api: Api<VirtualService> = Api::namespaced(ctx.client.clone(), namespace);
    let mut entry = vs_api
        .entry(&names.routing)
        .await?
        .or_insert(|| VirtualService::new(&names.routing, VirtualServiceSpec::default()));
    let vs = entry.get_mut();
    if vs.metadata.creation_timestamp.is_none() {
        vs.metadata.labels = Some(names.labels.clone());
        vs.metadata.owner_references = Some(vec![owner_reference(someapp)?]);
    }
    // Canary entries spliced in by other reconciles and user-tuned weights
    // must survive, so only the skeleton and the stable entry's presence are
    // converged here.
    vs.spec.gateways = vec!["mesh".to_string()];
    vs.spec.hosts = vec![names.service_host.clone()];
    ensure_stable_route(&mut vs.spec.http, names);
    entry.commit(&PostParams::default()).await?;
    debug!(msg = "virtual service reconciled", name = %names.routing);
    Ok(())
}

async fn apply_canary(names: &Names, ctx: &Context, namespace: &str) -> Result<()> {
    let vs_api: Api<VirtualService> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(mut vs) = vs_api.get_opt(&names.routing).await? else {
        // stable was never applied; nothing to splice into
        info!(msg = "stable routing object not found, skipping canary splice", name = %names.routing);
        return Ok(());
    };
    if splice_canary_route(&mut vs.spec.http, names)? {
        vs_api
            .replace(&names.routing, &PostParams::default(), &vs)
            .await?;
        info!(msg = "canary route spliced", routing = %names.routing, route = %names.canary_route);
    }

    let dr_api: Api<DestinationRule> = Api::namespaced(ctx.client.clone(), namespace);
    // The canary subset rule never carries an owner reference back to the
    // canary Someapp; the finalizer owns its teardown.
    match dr_api.entry(&names.subset_rule).await? {
        Entry::Vacant(entry) => {
            let mut dr = DestinationRule::new(
                &names.subset_rule,
                DestinationRuleSpec {
                    host: names.canary_host.clone(),
                    subsets: vec![canary_subset(&names.subset)],
                },
            );
            dr.meta_mut().labels = Some(names.labels.clone());
            entry.insert(dr).commit(&PostParams::default()).await?;
            debug!(msg = "canary destination rule created", name = %names.subset_rule);
        }
        Entry::Occupied(mut entry) => {
            let dr = entry.get_mut();
            if !dr.spec.subsets.iter().any(|s| s.name == names.subset) {
                dr.spec.subsets.push(canary_subset(&names.subset));
                entry.commit(&PostParams::default()).await?;
                debug!(msg = "canary subset appended", name = %names.subset_rule, subset = %names.subset);
            }
        }
    }
    Ok(())
}

/// Removes the canary route entry and canary subset installed by
/// [`apply_canary`]. Invoked by the finalizer while the canary Someapp is
/// being deleted.
pub async fn teardown(names: &Names, ctx: &Context, namespace: &str) -> Result<()> {
    let vs_api: Api<VirtualService> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(mut vs) = vs_api.get_opt(&names.routing).await? {
        if remove_route(&mut vs.spec.http, &names.canary_route) {
            vs_api
                .replace(&names.routing, &PostParams::default(), &vs)
                .await?;
            info!(msg = "canary route removed", routing = %names.routing, route = %names.canary_route);
        }
    }

    let dr_api: Api<DestinationRule> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(mut dr) = dr_api.get_opt(&names.subset_rule).await? {
        let before = dr.spec.subsets.len();
        dr.spec.subsets.retain(|s| s.name != names.subset);
        if dr.spec.subsets.len() != before {
            dr_api
                .replace(&names.subset_rule, &PostParams::default(), &dr)
                .await?;
            debug!(msg = "canary subset removed", name = %names.subset_rule, subset = %names.subset);
        }
    }
    Ok(())
}

fn stable_subset() -> Subset {
    Subset {
        name: "stable".to_string(),
        labels: BTreeMap::from([("version".to_string(), "stable".to_string())]),
    }
}

fn canary_subset(subset: &str) -> Subset {
    Subset {
        name: subset.to_string(),
        labels: BTreeMap::from([("version".to_string(), "canary".to_string())]),
    }
}

/// Appends the stable route entry when absent. Appending keeps the stable
/// entry last, behind any canary entries already spliced in.
fn ensure_stable_route(http: &mut Vec<HttpRoute>, names: &Names) {
    if http
        .iter()
        .any(|r| r.name.as_deref() == Some(names.stable_route.as_str()))
    {
        return;
    }
    http.push(HttpRoute {
        name: Some(names.stable_route.clone()),
        route: vec![HttpRouteDestination {
            destination: Destination {
                host: names.service_host.clone(),
                subset: Some("stable".to_string()),
            },
            weight: Some(0),
        }],
    });
}

/// Splices the canary route entry in front of the stable one. Returns false
/// when an entry of that name is already present (the presence check is the
/// de-dup key under retries), an error when the stable entry is missing.
fn splice_canary_route(http: &mut Vec<HttpRoute>, names: &Names) -> Result<bool> {
    if http
        .iter()
        .any(|r| r.name.as_deref() == Some(names.canary_route.as_str()))
    {
        return Ok(false);
    }
    let stable_index = http
        .iter()
        .position(|r| r.name.as_deref() == Some(names.stable_route.as_str()))
        .ok_or_else(|| Error::MissingStableRoute(names.routing.clone()))?;

    let stable = &mut http[stable_index];
    for destination in &mut stable.route {
        if destination.destination.subset.as_deref() == Some("stable") {
            destination.weight = Some(100);
        }
    }
    let mut route = stable.route.clone();
    route.push(HttpRouteDestination {
        destination: Destination {
            host: names.canary_host.clone(),
            subset: Some(names.subset.clone()),
        },
        weight: Some(0),
    });
    http.insert(
        stable_index,
        HttpRoute {
            name: Some(names.canary_route.clone()),
            route,
        },
    );
    Ok(true)
}

fn remove_route(http: &mut Vec<HttpRoute>, name: &str) -> bool {
    let before = http.len();
    http.retain(|r| r.name.as_deref() != Some(name));
    http.len() != before
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::someapp::SomeappSpec;
    use crate::someapp::naming;

    use kube::Resource;

    fn canary_names(tag: &str) -> Names {
        let spec: SomeappSpec = serde_json::from_value(serde_json::json!({
            "name": "web",
            "version": "canary",
            "canaryTag": tag,
            "enableIstio": true,
            "containers": [{"name": "app", "ports": [{"name": "http", "containerPort": 8080}]}],
        }))
        .unwrap();
        let mut someapp = Someapp::new("web-canary", spec);
        someapp.meta_mut().namespace = Some("default".to_string());
        naming::derive(&someapp).unwrap()
    }

    fn stable_http(names: &Names) -> Vec<HttpRoute> {
        let mut http = Vec::new();
        ensure_stable_route(&mut http, names);
        http
    }

    #[test]
    fn splice_inserts_canary_before_stable() {
        let names = canary_names("canary-v1.2.3");
        let mut http = stable_http(&names);
        assert!(splice_canary_route(&mut http, &names).unwrap());

        assert_eq!(http.len(), 2);
        assert_eq!(http[0].name.as_deref(), Some("web-canary-v1-2-3"));
        assert_eq!(http[1].name.as_deref(), Some("web-stable"));

        // the stable entry's stable destination is bumped to weight 100
        assert_eq!(http[1].route[0].weight, Some(100));

        // the canary entry carries the stable destination plus the new one
        let canary = &http[0].route;
        assert_eq!(canary.len(), 2);
        assert_eq!(canary[0].destination.subset.as_deref(), Some("stable"));
        assert_eq!(canary[0].weight, Some(100));
        assert_eq!(
            canary[1].destination.host,
            "web-canary.default.svc.cluster.local"
        );
        assert_eq!(canary[1].destination.subset.as_deref(), Some("canary-v1-2-3"));
        assert_eq!(canary[1].weight, Some(0));
    }

    #[test]
    fn splice_is_idempotent() {
        let names = canary_names("canary-v1.2.3");
        let mut http = stable_http(&names);
        assert!(splice_canary_route(&mut http, &names).unwrap());
        assert!(!splice_canary_route(&mut http, &names).unwrap());
        assert_eq!(http.len(), 2);
    }

    #[test]
    fn distinct_tags_each_get_one_entry_stable_stays_last() {
        let one = canary_names("canary-v1.2.3");
        let two = canary_names("canary-v2.0.0");
        let mut http = stable_http(&one);
        assert!(splice_canary_route(&mut http, &one).unwrap());
        assert!(splice_canary_route(&mut http, &two).unwrap());

        let entry_names: Vec<_> = http.iter().map(|r| r.name.clone().unwrap()).collect();
        assert_eq!(entry_names.len(), 3);
        assert!(entry_names.contains(&"web-canary-v1-2-3".to_string()));
        assert!(entry_names.contains(&"web-canary-v2-0-0".to_string()));
        assert_eq!(entry_names.last().unwrap(), "web-stable");
    }

    #[test]
    fn splice_without_stable_entry_errors() {
        let names = canary_names("canary-v1.2.3");
        let mut http = Vec::new();
        assert!(matches!(
            splice_canary_route(&mut http, &names),
            Err(Error::MissingStableRoute(_))
        ));
    }

    #[test]
    fn teardown_restores_single_stable_entry() {
        let names = canary_names("canary-v1.2.3");
        let mut http = stable_http(&names);
        splice_canary_route(&mut http, &names).unwrap();

        assert!(remove_route(&mut http, &names.canary_route));
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].name.as_deref(), Some("web-stable"));
        // removing again is a no-op
        assert!(!remove_route(&mut http, &names.canary_route));
    }

    #[test]
    fn ensure_stable_route_appends_after_canaries() {
        let names = canary_names("canary-v1.2.3");
        let mut http = stable_http(&names);
        splice_canary_route(&mut http, &names).unwrap();
        // a hand-edit dropped the stable entry
        remove_route(&mut http, &names.stable_route);

        ensure_stable_route(&mut http, &names);
        assert_eq!(http.len(), 2);
        assert_eq!(http.last().unwrap().name.as_deref(), Some("web-stable"));
    }

    #[test]
    fn subset_constructors() {
        assert_eq!(stable_subset().labels["version"], "stable");
        let subset = canary_subset("canary-v1-2-3");
        assert_eq!(subset.name, "canary-v1-2-3");
        assert_eq!(subset.labels["version"], "canary");
    }
}
