//! Admission filters deciding which watch events reach the work queues.

use k8s_openapi::api::{
    core::v1::{Namespace, Node},
    networking::v1::Ingress,
};
use kube::Resource;

use crate::{FRP_INGRESS_CLASS, INGRESS_CLASS_ANNOTATION, queue::object_key, tenant_of};

/// A change observed on a watched object.
///
/// The periodic resync delivers every cached object as an update onto itself.
#[derive(Debug)]
pub enum Change<'a, K> {
    Added(&'a K),
    Updated { old: &'a K, new: &'a K },
    Deleted(&'a K),
}

impl<'a, K> Change<'a, K> {
    /// The object as it is after the change, or as it was last seen when it was deleted.
    pub fn current(&self) -> &'a K {
        match *self {
            Change::Added(obj) | Change::Deleted(obj) => obj,
            Change::Updated { new, .. } => new,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Change::Deleted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Enqueue(String),
    Ignore,
}

/// An Ingress is ours if its class annotation is unset, empty or names the frp class.
pub fn is_frp_ingress(ingress: &Ingress) -> bool {
    let class = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(INGRESS_CLASS_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();
    class.is_empty() || class == FRP_INGRESS_CLASS
}

/// Namespaces and nodes are ours if they carry a non-empty tenant label.
pub fn is_tenant_resource<K: Resource>(obj: &K) -> bool {
    tenant_of(obj.meta()).is_some()
}

fn enqueue_if<K: Resource>(in_scope: bool, obj: &K) -> Admission {
    match object_key(obj.meta()) {
        Some(key) if in_scope => Admission::Enqueue(key),
        _ => Admission::Ignore,
    }
}

/// Ingresses are enqueued on every add or update that keeps them in scope, resyncs included.
/// Deletions are left to garbage collection.
pub fn admit_ingress(change: Change<'_, Ingress>) -> Admission {
    let ingress = change.current();
    enqueue_if(!change.is_deletion() && is_frp_ingress(ingress), ingress)
}

pub fn admit_namespace(change: Change<'_, Namespace>) -> Admission {
    let namespace = change.current();
    enqueue_if(!change.is_deletion() && is_tenant_resource(namespace), namespace)
}

/// Updates of nodes are only enqueued when the resource version moved, so status-only resyncs
/// are skipped.
pub fn admit_node(change: Change<'_, Node>) -> Admission {
    match change {
        Change::Added(node) => enqueue_if(is_tenant_resource(node), node),
        Change::Updated { old, new } => {
            let changed = old.metadata.resource_version != new.metadata.resource_version;
            enqueue_if(changed && is_tenant_resource(new), new)
        }
        Change::Deleted(_) => Admission::Ignore,
    }
}

/// Keys of the in-scope Ingresses of `namespace`. They are re-enqueued with their namespace, since
/// an Ingress is a no-op until its namespace carries a tenant.
pub fn ingresses_in<'a>(namespace: &str, ingresses: impl IntoIterator<Item = &'a Ingress>) -> Vec<String> {
    ingresses
        .into_iter()
        .filter(|ingress| ingress.metadata.namespace.as_deref() == Some(namespace) && is_frp_ingress(ingress))
        .filter_map(|ingress| object_key(&ingress.metadata))
        .collect()
}

/// Keys of every tenant namespace. A deleted broker service hands its ports back, so namespaces
/// deferred on exhausted ports get another chance.
pub fn tenant_namespaces<'a>(namespaces: impl IntoIterator<Item = &'a Namespace>) -> Vec<String> {
    namespaces
        .into_iter()
        .filter(|namespace| is_tenant_resource(*namespace))
        .filter_map(|namespace| object_key(&namespace.metadata))
        .collect()
}
