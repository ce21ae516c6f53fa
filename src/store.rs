//! Access to cluster state.
//!
//! Reads of watched kinds are served from reflector caches that the controller keeps up to date;
//! writes go straight to the API server.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{Namespace, Node, Pod, Service},
    networking::v1::Ingress,
};
use kube::{
    Api, Client,
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::reflector::{ObjectRef, Store},
};
use log::{info, warn};
use serde_json::json;

use crate::{
    CONTROLLER_NAME, Error, Result,
    simpleevent::{Warning, WarningRecorder},
};

///
/// The cluster as seen by the reconcilers and the renderer.
///
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Cached namespace lookup.
    fn namespace(&self, name: &str) -> Option<Arc<Namespace>>;

    /// Cached Ingress lookup.
    fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>>;

    /// Cached node lookup.
    fn node(&self, name: &str) -> Option<Arc<Node>>;

    /// Cached service lookup.
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;

    /// Lists the services of a namespace from the API server, bypassing the cache.
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Creates a pod. A pod that already exists is not an error.
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Creates a service. A service that already exists is not an error.
    async fn create_service(&self, service: &Service) -> Result<()>;

    /// Replaces the selector keys of a service with a merge patch.
    async fn patch_service_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Records a warning event about a reconciled object.
    async fn publish_warning(&self, warning: &Warning) -> Result<()>;
}

/// Returns the namespace and name from the object's metadata.
fn namespaced_name<'a>(kind: &str, meta: &'a kube::api::ObjectMeta) -> Result<(&'a str, &'a str)> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::UnexpectedError(format!("{kind} does not have a name")))?;
    let namespace = meta
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UnexpectedError(format!("{kind} `{name}` does not have a namespace")))?;
    Ok((namespace, name))
}

/// Maps "already exists" to success.
fn tolerate_conflict(kind: &str, namespace: &str, name: &str, result: kube::Result<()>) -> Result<()> {
    match result {
        Err(kube::Error::Api(response)) if response.code == 409 => {
            info!("{kind} `{namespace}/{name}` already exists");
            Ok(())
        }
        other => Ok(other?),
    }
}

///
/// [`ClusterStore`] backed by reflector caches and a Kubernetes client.
///
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    events: WarningRecorder,
    ingresses: Store<Ingress>,
    namespaces: Store<Namespace>,
    nodes: Store<Node>,
    services: Store<Service>,
}

impl KubeStore {
    pub fn new(
        client: Client,
        ingresses: Store<Ingress>,
        namespaces: Store<Namespace>,
        nodes: Store<Node>,
        services: Store<Service>,
    ) -> Self {
        let events = WarningRecorder::from_client(client.clone());
        Self {
            client,
            events,
            ingresses,
            namespaces,
            nodes,
            services,
        }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(&ObjectRef::new(name))
    }

    fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
        self.ingresses.get(&ObjectRef::new(name).within(namespace))
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(Api::<Service>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let (namespace, name) = namespaced_name("Pod", &pod.metadata)?;
        let result = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .create(&post_params(), pod)
            .await
            .map(|_| ());
        tolerate_conflict("Pod", namespace, name, result)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(Api::<Service>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        let (namespace, name) = namespaced_name("Service", &service.metadata)?;
        let result = Api::<Service>::namespaced(self.client.clone(), namespace)
            .create(&post_params(), service)
            .await
            .map(|_| ());
        tolerate_conflict("Service", namespace, name, result)
    }

    async fn patch_service_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<()> {
        Api::<Service>::namespaced(self.client.clone(), namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({
                    "spec": {
                        "selector": selector
                    }
                })),
            )
            .await?;
        Ok(())
    }

    async fn publish_warning(&self, warning: &Warning) -> Result<()> {
        if let Err(e) = self.events.publish(warning).await {
            // Events are best effort; a failure to record one must not fail the reconcile.
            warn!("Failed to publish `{}` event: {e}", warning.reason);
        }
        Ok(())
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}
