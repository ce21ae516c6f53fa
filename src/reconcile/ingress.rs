use std::sync::Arc;

use kube::ResourceExt;
use log::{debug, info};

use super::ReconcileContext;
use crate::{
    Error, Outcome, Result,
    objects::{is_controlled_by, tunnel_client_pod},
    queue::split_key,
    simpleevent::{Reason, Warning},
    tenant_of,
};

///
/// Ensures the tunnel-client pod of an Ingress exists. The pod shares the Ingress' name and
/// namespace; a same-named pod that the Ingress does not control is never adopted.
///
pub async fn reconcile_ingress(key: String, ctx: Arc<ReconcileContext>) -> Result<Outcome> {
    let Some((Some(namespace), name)) = split_key(&key) else {
        info!("Invalid resource key `{key}`");
        return Ok(Outcome::Applied);
    };

    let Some(ns) = ctx.store.namespace(namespace) else {
        info!("Namespace `{namespace}` of ingress `{key}` no longer exists");
        return Ok(Outcome::Applied);
    };
    let Some(tenant) = tenant_of(&ns.metadata) else {
        debug!("Tenant not found for namespace `{namespace}`, no-op");
        return Ok(Outcome::Applied);
    };
    debug!("{namespace} - Found tenant `{tenant}`");

    let Some(ingress) = ctx.store.ingress(namespace, name) else {
        info!("Ingress `{key}` in work queue no longer exists");
        return Ok(Outcome::Applied);
    };

    match ctx.store.get_pod(namespace, name).await? {
        None => {
            let pod = tunnel_client_pod(&ingress, &ctx.config)?;
            ctx.store.create_pod(&pod).await?;
            ctx.clear_conflict(&key);
            info!("Created tunnel client pod `{key}`");
        }
        Some(pod) if !is_controlled_by(&pod.metadata, ingress.uid().as_deref()) => {
            let conflict = Error::OwnershipConflict {
                kind: "Pod",
                name: name.to_string(),
            };
            // Retries of the same conflict are not reported again.
            if ctx.report_conflict(&key) {
                let warning = Warning::new(ingress.as_ref(), Reason::ResourceExists, conflict.to_string());
                ctx.store.publish_warning(&warning).await?;
            }
            return Err(conflict);
        }
        Some(_) => {
            ctx.clear_conflict(&key);
            debug!("Tunnel client pod `{key}` is up to date");
        }
    }

    Ok(Outcome::Applied)
}
