use std::{collections::BTreeMap, sync::Arc};

use log::{debug, info};

use super::ReconcileContext;
use crate::{
    Outcome, Result, TENANT_SELECTOR_KEY,
    objects::{kubelet_service, peer_service_name},
    queue::split_key,
    tenant_of,
};

///
/// Ensures the peer service of a tenant node exists and selects the node's current tenant.
///
/// Nodes are expected to be named after a cluster DNS name (e.g. `worker-1.svc.cluster.local`);
/// the first label names the service in the controller's namespace.
///
pub async fn reconcile_node(key: String, ctx: Arc<ReconcileContext>) -> Result<Outcome> {
    let Some((None, name)) = split_key(&key) else {
        info!("Invalid resource key `{key}`");
        return Ok(Outcome::Applied);
    };
    let Some(node) = ctx.store.node(name) else {
        info!("Node `{name}` in work queue no longer exists");
        return Ok(Outcome::Applied);
    };
    let Some(tenant) = tenant_of(&node.metadata) else {
        debug!("Tenant not found for node `{name}`, no-op");
        return Ok(Outcome::Applied);
    };

    let system_namespace = ctx.config.system_namespace.as_str();
    let service_name = peer_service_name(name);

    match ctx.store.get_service(system_namespace, service_name).await? {
        None => {
            let service = kubelet_service(&node, service_name, tenant, &ctx.config)?;
            ctx.store.create_service(&service).await?;
            info!("Created kubelet service `{service_name}` for node `{name}` (tenant `{tenant}`)");
        }
        Some(existing) => {
            let current = existing
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.as_ref())
                .and_then(|selector| selector.get(TENANT_SELECTOR_KEY));
            if current.map(String::as_str) == Some(tenant) {
                debug!("Kubelet service `{service_name}` already selects tenant `{tenant}`");
            } else {
                let selector = BTreeMap::from([(TENANT_SELECTOR_KEY.to_string(), tenant.to_string())]);
                ctx.store
                    .patch_service_selector(system_namespace, service_name, &selector)
                    .await?;
                info!("Patched kubelet service `{service_name}` to select tenant `{tenant}`");
            }
        }
    }

    Ok(Outcome::Applied)
}
