use std::sync::Arc;

use log::{debug, info, warn};

use super::ReconcileContext;
use crate::{
    Outcome, Result,
    objects::{BrokerPorts, broker_pod, broker_service, is_running, port_set},
    queue::split_key,
    simpleevent::{Reason, Warning},
    tenant_of,
};

///
/// Ensures a tenant namespace has its broker: a service exposing three freshly allocated ports on
/// the node IP, and the broker pod behind it. Both are named after the tenant and live in the
/// controller's namespace.
///
/// An existing broker service keeps the ports it was created with, and a broker pod that is not
/// running is only reported; neither is replaced.
///
pub async fn reconcile_namespace(key: String, ctx: Arc<ReconcileContext>) -> Result<Outcome> {
    let Some((None, name)) = split_key(&key) else {
        info!("Invalid resource key `{key}`");
        return Ok(Outcome::Applied);
    };
    let Some(ns) = ctx.store.namespace(name) else {
        info!("Namespace `{name}` in work queue no longer exists");
        return Ok(Outcome::Applied);
    };
    let Some(tenant) = tenant_of(&ns.metadata) else {
        debug!("Tenant not found for namespace `{name}`, no-op");
        return Ok(Outcome::Applied);
    };

    let config = &ctx.config;
    let system_namespace = config.system_namespace.as_str();
    let node_ip = config.node_ip.as_str();

    {
        // Held until the broker service exists so no other namespace can be handed the same ports.
        let mut ports = ctx.ports.lock().await;
        let services = ctx.store.list_services(system_namespace).await?;
        ports.reload(node_ip, &services);

        let Some(allocated) = ports
            .pop_many(node_ip, BrokerPorts::COUNT)
            .as_deref()
            .and_then(BrokerPorts::from_slice)
        else {
            let reason = format!("Max ports allocation reached for IP `{node_ip}`");
            warn!("{reason}");
            let warning = Warning::new(ns.as_ref(), Reason::PortsExhausted, reason.clone());
            ctx.store.publish_warning(&warning).await?;
            return Ok(Outcome::Deferred(reason));
        };

        let desired = broker_service(&ns, tenant, allocated, config)?;
        match ctx.store.get_service(system_namespace, tenant).await? {
            None => {
                ctx.store.create_service(&desired).await?;
                info!(
                    "Created tenant service `{tenant}` with ports {}, {}, {}",
                    allocated.frps, allocated.http, allocated.https
                );
            }
            Some(existing) if port_set(&existing) != port_set(&desired) => {
                debug!(
                    "Tenant service `{tenant}` keeps its ports {:?}, not moving it to {:?}",
                    port_set(&existing),
                    port_set(&desired)
                );
            }
            Some(_) => {}
        }
    }

    match ctx.store.get_pod(system_namespace, tenant).await? {
        None => {
            ctx.store.create_pod(&broker_pod(&ns, tenant, config)?).await?;
            info!("Created tenant pod `{tenant}`");
        }
        Some(pod) if !is_running(&pod) => {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
            warn!("The broker pod `{tenant}` should be running, got status `{phase}`");
        }
        Some(_) => {}
    }

    Ok(Outcome::Applied)
}
