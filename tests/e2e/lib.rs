#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::{Api, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;
    use someapp_operator::crd::istio::{DestinationRule, VirtualService};
    use someapp_operator::crd::someapp::{Phase, Someapp, SomeappSpec};
    use someapp_operator::someapp::reconcile::SOMEAPP_FINALIZER;
    use tokio::time::timeout;

    fn someapp(name: &str, overrides: serde_json::Value) -> Someapp {
        let mut spec = json!({
            "name": name,
            "containers": [{
                "name": "app",
                "image": "inanimate/echo-server:latest",
                "ports": [{"name": "http", "containerPort": 8080}],
            }],
        });
        spec.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().unwrap().clone());
        let spec: SomeappSpec = serde_json::from_value(spec).unwrap();
        Someapp::new(name, spec)
    }

    fn is_someapp_running() -> impl Condition<Someapp> {
        |obj: Option<&Someapp>| {
            if let Some(someapp) = &obj {
                if let Some(status) = &someapp.status {
                    return status.phase == Some(Phase::Running);
                }
            }
            false
        }
    }

    fn is_deployment_ready() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            if let Some(deployment) = &obj {
                if let Some(status) = &deployment.status {
                    return status.replicas == status.updated_replicas
                        && status.replicas == status.ready_replicas;
                }
            }
            false
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(30),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn setup(someapp: &Someapp) -> (Client, Api<Someapp>) {
        let client = Client::try_default().await.unwrap();
        let someapp_api = Api::<Someapp>::namespaced(client.clone(), "default");
        someapp_api
            .create(&PostParams::default(), someapp)
            .await
            .unwrap();
        wait_for(someapp_api.clone(), &someapp.name_any(), is_someapp_running()).await;
        (client, someapp_api)
    }

    #[tokio::test]
    async fn someapp_create_stable_api() {
        let name = "test-create";
        let (client, _) = setup(&someapp(name, json!({}))).await;

        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        let deployment = deployment_api.get(name).await.unwrap();
        assert_eq!(
            deployment.spec.unwrap().template.spec.unwrap().containers[0].name,
            "app"
        );

        let service = Api::<Service>::namespaced(client.clone(), "default")
            .get(name)
            .await
            .unwrap();
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);

        // no autoscaler without setHpa
        let hpa_api = Api::<HorizontalPodAutoscaler>::namespaced(client, "default");
        assert!(hpa_api.get_opt(name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn someapp_autoscaler_bounds() {
        let name = "test-hpa";
        let (client, _) = setup(&someapp(
            name,
            json!({"setHpa": "2->5", "hpaCpuUsage": 70}),
        ))
        .await;

        let hpa = Api::<HorizontalPodAutoscaler>::namespaced(client, "default")
            .get(name)
            .await
            .unwrap();
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 5);
        let target = spec.metrics.unwrap()[0].resource.clone().unwrap().target;
        assert_eq!(target.average_utilization, Some(70));
    }

    #[tokio::test]
    async fn someapp_autoscaler_swapped_bounds() {
        let name = "test-hpa-swap";
        let (client, _) = setup(&someapp(name, json!({"setHpa": "9->3"}))).await;

        let hpa = Api::<HorizontalPodAutoscaler>::namespaced(client, "default")
            .get(name)
            .await
            .unwrap();
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.min_replicas, Some(3));
        assert_eq!(spec.max_replicas, 9);
    }

    #[tokio::test]
    async fn someapp_script_has_no_service() {
        let name = "test-script";
        let (client, _) = setup(&someapp(name, json!({"type": "script"}))).await;

        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        let workload = format!("{name}-{name}");
        wait_for(deployment_api, &workload, is_deployment_ready()).await;

        let service_api = Api::<Service>::namespaced(client, "default");
        assert!(service_api.get_opt(name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn someapp_delete_cascades_to_children() {
        let name = "test-delete";
        let (client, someapp_api) = setup(&someapp(name, json!({}))).await;

        let deployment_api = Api::<Deployment>::namespaced(client, "default");
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        let deployment = deployment_api.get(name).await.unwrap();
        let someapp = someapp_api.get(name).await.unwrap();

        someapp_api.delete(name, &Default::default()).await.unwrap();
        wait_for(
            someapp_api.clone(),
            name,
            conditions::is_deleted(&someapp.uid().unwrap()),
        )
        .await;
        wait_for(
            deployment_api,
            name,
            conditions::is_deleted(&deployment.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn someapp_canary_splice_and_teardown() {
        let name = "test-mesh";
        let (client, someapp_api) = setup(&someapp(name, json!({"enableIstio": true}))).await;

        let vs_api = Api::<VirtualService>::namespaced(client.clone(), "default");
        let vs = vs_api.get(name).await.unwrap();
        assert_eq!(vs.spec.http.len(), 1);
        assert_eq!(
            vs.spec.http[0].name.as_deref(),
            Some(format!("{name}-stable").as_str())
        );

        // splice a canary of the same app in
        let canary_name = format!("{name}-canary");
        let canary = {
            let mut c = someapp(
                name,
                json!({
                    "version": "canary",
                    "canaryTag": "canary-v1.2.3",
                    "enableIstio": true,
                }),
            );
            c.metadata.name = Some(canary_name.clone());
            c
        };
        someapp_api
            .create(&PostParams::default(), &canary)
            .await
            .unwrap();
        wait_for(someapp_api.clone(), &canary_name, is_someapp_running()).await;

        let canary_stored = someapp_api.get(&canary_name).await.unwrap();
        assert!(canary_stored
            .finalizers()
            .contains(&SOMEAPP_FINALIZER.to_string()));

        let vs = vs_api.get(name).await.unwrap();
        assert_eq!(vs.spec.http.len(), 2);
        assert_eq!(
            vs.spec.http[0].name.as_deref(),
            Some(format!("{name}-canary-v1-2-3").as_str())
        );
        assert_eq!(
            vs.spec.http[1].name.as_deref(),
            Some(format!("{name}-stable").as_str())
        );
        let stable_destination = &vs.spec.http[1].route[0];
        assert_eq!(stable_destination.weight, Some(100));

        let dr_api = Api::<DestinationRule>::namespaced(client, "default");
        let dr = dr_api.get(&canary_name).await.unwrap();
        assert!(dr.spec.subsets.iter().any(|s| s.name == "canary-v1-2-3"));

        // teardown restores the stable-only routing
        someapp_api
            .delete(&canary_name, &Default::default())
            .await
            .unwrap();
        wait_for(
            someapp_api,
            &canary_name,
            conditions::is_deleted(&canary_stored.uid().unwrap()),
        )
        .await;

        let vs = vs_api.get(name).await.unwrap();
        assert_eq!(vs.spec.http.len(), 1);
        assert_eq!(
            vs.spec.http[0].name.as_deref(),
            Some(format!("{name}-stable").as_str())
        );
        let dr = dr_api.get(&canary_name).await.unwrap();
        assert!(dr.spec.subsets.iter().all(|s| s.name != "canary-v1-2-3"));
    }
}
